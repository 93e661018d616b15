//! Host-memory reference backend
//!
//! Treats host allocations as "device" regions and runs a straightforward
//! strided GEMM. Loop order is fixed, so repeated runs over the same inputs
//! are bit-identical. A byte budget stands in for device memory so that
//! out-of-memory handling can be exercised without a GPU.

use std::collections::HashMap;

use crate::backend::{GemmBackend, GemmCall, RegionId, Transpose};
use crate::error::DeviceError;

/// Default device memory budget: 1GB
pub const DEFAULT_MEMORY_BUDGET: u64 = 1024 * 1024 * 1024;

const ELEMENT_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Counters of every backend call, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub allocations: u64,
    pub frees: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub gemms: u64,
    pub synchronizations: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl BackendStats {
    /// Host<->device copies in either direction
    pub fn transfers(&self) -> u64 {
        self.uploads + self.downloads
    }
}

/// Reference backend running on the host CPU.
pub struct CpuBackend {
    regions: HashMap<u64, Vec<f32>>,
    next_region: u64,
    memory_budget: u64,
    memory_used: u64,
    stats: BackendStats,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// Create a backend whose allocations may not exceed `bytes` in total.
    pub fn with_memory_budget(bytes: u64) -> Self {
        log::debug!("CpuBackend: memory budget {} bytes", bytes);
        Self {
            regions: HashMap::new(),
            next_region: 0,
            memory_budget: bytes,
            memory_used: 0,
            stats: BackendStats::default(),
        }
    }

    pub fn stats(&self) -> BackendStats {
        self.stats
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used
    }

    fn region(&self, region: RegionId) -> Result<&Vec<f32>, DeviceError> {
        self.regions
            .get(&region.0)
            .ok_or(DeviceError::UnknownRegion(region.0))
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GemmBackend for CpuBackend {
    fn device_name(&self) -> String {
        "cpu-reference".to_string()
    }

    fn available_memory(&self) -> u64 {
        self.memory_budget - self.memory_used
    }

    fn allocate(&mut self, bytes: u64) -> Result<RegionId, DeviceError> {
        let available = self.available_memory();
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let id = self.next_region;
        self.next_region += 1;
        self.regions
            .insert(id, vec![0.0; (bytes / ELEMENT_SIZE) as usize]);
        self.memory_used += bytes;
        self.stats.allocations += 1;

        log::debug!("CpuBackend: allocated region {} ({} bytes)", id, bytes);
        Ok(RegionId(id))
    }

    fn free(&mut self, region: RegionId) -> Result<(), DeviceError> {
        let data = self
            .regions
            .remove(&region.0)
            .ok_or(DeviceError::UnknownRegion(region.0))?;
        self.memory_used -= data.len() as u64 * ELEMENT_SIZE;
        self.stats.frees += 1;
        log::debug!("CpuBackend: freed region {}", region.0);
        Ok(())
    }

    fn upload(&mut self, region: RegionId, data: &[f32]) -> Result<(), DeviceError> {
        let target = self
            .regions
            .get_mut(&region.0)
            .ok_or(DeviceError::UnknownRegion(region.0))?;
        if target.len() != data.len() {
            return Err(DeviceError::SizeMismatch {
                host: data.len() as u64 * ELEMENT_SIZE,
                device: target.len() as u64 * ELEMENT_SIZE,
            });
        }
        target.copy_from_slice(data);
        self.stats.uploads += 1;
        self.stats.bytes_uploaded += data.len() as u64 * ELEMENT_SIZE;
        Ok(())
    }

    fn download(&mut self, region: RegionId) -> Result<Vec<f32>, DeviceError> {
        let data = self.region(region)?.clone();
        self.stats.downloads += 1;
        self.stats.bytes_downloaded += data.len() as u64 * ELEMENT_SIZE;
        Ok(data)
    }

    fn gemm(&mut self, call: &GemmCall) -> Result<(), DeviceError> {
        call.check_extents(|region| self.regions.get(&region.0).map(Vec::len))?;

        // Take C out of the map so A and B can be borrowed alongside it
        let mut c = self
            .regions
            .remove(&call.c.0)
            .ok_or(DeviceError::UnknownRegion(call.c.0))?;
        let a = &self.regions[&call.a.0];
        let b = &self.regions[&call.b.0];

        for j in 0..call.n {
            for i in 0..call.m {
                let mut acc = 0.0f32;
                for p in 0..call.k {
                    let a_ip = match call.trans_a {
                        Transpose::No => a[i + p * call.lda],
                        Transpose::Yes => a[p + i * call.lda],
                    };
                    let b_pj = match call.trans_b {
                        Transpose::No => b[p + j * call.ldb],
                        Transpose::Yes => b[j + p * call.ldb],
                    };
                    acc += a_ip * b_pj;
                }
                let out = &mut c[i + j * call.ldc];
                // beta == 0 overwrites without reading, so stale NaNs do not leak
                *out = if call.beta == 0.0 {
                    call.alpha * acc
                } else {
                    call.alpha * acc + call.beta * *out
                };
            }
        }

        self.regions.insert(call.c.0, c);
        self.stats.gemms += 1;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        // Work completes inside `gemm`
        self.stats.synchronizations += 1;
        Ok(())
    }
}
