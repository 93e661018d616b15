//! Device backends
//!
//! The pipeline only needs one capability from an accelerator: a
//! single-precision, column-major GEMM with scale-and-accumulate semantics,
//! plus raw region allocation and host/device copies. `GemmBackend` is that
//! seam. `CpuBackend` is the always-available reference implementation;
//! `VulkanBackend` runs the same calls on a GPU when the `vulkan` feature is
//! enabled.

use crate::error::DeviceError;

pub mod cpu;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use cpu::{BackendStats, CpuBackend};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;

/// Opaque id of a device allocation, issued by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

/// Operand transposition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transpose {
    #[default]
    #[serde(rename = "N", alias = "n")]
    No,
    #[serde(rename = "T", alias = "t")]
    Yes,
}

impl Transpose {
    pub fn is_transposed(self) -> bool {
        matches!(self, Transpose::Yes)
    }
}

/// One column-major GEMM: `C = alpha * op(A) * op(B) + beta * C`.
///
/// `op(A)` is `m x k`, `op(B)` is `k x n`, `C` is `m x n`. Leading
/// dimensions are in elements.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GemmCall {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub a: RegionId,
    pub lda: usize,
    pub b: RegionId,
    pub ldb: usize,
    pub beta: f32,
    pub c: RegionId,
    pub ldc: usize,
}

impl GemmCall {
    /// Floating point operations performed by the call (multiply-add counted as two).
    pub fn flops(&self) -> u64 {
        2 * self.m as u64 * self.n as u64 * self.k as u64
    }

    /// Check strides and that every operand fits its region.
    ///
    /// `region_elements` returns the length of a live region, `None` if the
    /// id is unknown. Backends call this before touching memory.
    pub fn check_extents(
        &self,
        region_elements: impl Fn(RegionId) -> Option<usize>,
    ) -> Result<(), DeviceError> {
        let (a_rows, a_cols) = stored_shape(self.trans_a, self.m, self.k);
        let (b_rows, b_cols) = stored_shape(self.trans_b, self.k, self.n);

        let operands = [
            ("A", self.a, a_rows, a_cols, self.lda),
            ("B", self.b, b_rows, b_cols, self.ldb),
            ("C", self.c, self.m, self.n, self.ldc),
        ];

        for (name, region, rows, cols, ld) in operands {
            if ld < rows.max(1) {
                return Err(DeviceError::Rejected(format!(
                    "leading dimension of {} is {} but {} rows are stored",
                    name, ld, rows
                )));
            }
            let len = region_elements(region).ok_or(DeviceError::UnknownRegion(region.0))?;
            let footprint = column_major_footprint(rows, cols, ld).ok_or_else(|| {
                DeviceError::Rejected(format!(
                    "operand {} with leading dimension {} overflows the address space",
                    name, ld
                ))
            })?;
            if footprint > len {
                return Err(DeviceError::Rejected(format!(
                    "operand {} addresses {} elements but its region holds {}",
                    name, footprint, len
                )));
            }
        }

        if self.c == self.a || self.c == self.b {
            return Err(DeviceError::Rejected(
                "output region aliases an input operand".to_string(),
            ));
        }

        Ok(())
    }
}

/// Stored (rows, cols) of an operand whose logical shape is `rows x cols`.
pub fn stored_shape(trans: Transpose, rows: usize, cols: usize) -> (usize, usize) {
    match trans {
        Transpose::No => (rows, cols),
        Transpose::Yes => (cols, rows),
    }
}

/// Accelerator capability used by the pipeline.
///
/// Calls are issued from one thread in program order. `gemm` may return
/// before the device has finished; `synchronize` must not return until all
/// previously issued work is complete and visible. `upload` and `download`
/// block the caller and are ordered after previously issued work.
pub trait GemmBackend {
    /// Human-readable name of the bound device
    fn device_name(&self) -> String;

    /// Bytes still available for allocation
    fn available_memory(&self) -> u64;

    /// Reserve a device region of `bytes` bytes
    fn allocate(&mut self, bytes: u64) -> Result<RegionId, DeviceError>;

    /// Free a device region
    fn free(&mut self, region: RegionId) -> Result<(), DeviceError>;

    /// Copy `data` into the region; length must equal the region size
    fn upload(&mut self, region: RegionId, data: &[f32]) -> Result<(), DeviceError>;

    /// Copy the whole region back to the host
    fn download(&mut self, region: RegionId) -> Result<Vec<f32>, DeviceError>;

    /// Issue one GEMM
    fn gemm(&mut self, call: &GemmCall) -> Result<(), DeviceError>;

    /// Wait until all issued work has completed
    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

/// Number of elements addressed by a column-major `rows x cols` matrix with
/// leading dimension `ld`, or `None` if that count does not fit in `usize`.
pub fn column_major_footprint(rows: usize, cols: usize, ld: usize) -> Option<usize> {
    if rows == 0 || cols == 0 {
        return Some(0);
    }
    ld.checked_mul(cols - 1)?.checked_add(rows)
}
