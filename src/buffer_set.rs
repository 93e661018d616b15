//! Buffer Set: device regions shared by all stages
//!
//! Buffers are allocated once before any stage runs, reused read/write by
//! every stage that names them, and released once at the end. Stages never
//! see raw regions; they see a `MatrixView`, which is checked against the
//! buffer's fixed capacity when it is built.

use serde::{Deserialize, Serialize};

use crate::backend::{column_major_footprint, GemmBackend, RegionId};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// Size of one element in bytes
pub const ELEMENT_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Slot a buffer is meant to fill in a GEMM
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferRole {
    #[serde(alias = "a")]
    A,
    #[serde(alias = "b")]
    B,
    #[serde(alias = "c")]
    C,
}

impl std::fmt::Display for BufferRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferRole::A => "A",
            BufferRole::B => "B",
            BufferRole::C => "C",
        };
        f.write_str(name)
    }
}

/// Storage order used to interpret leading dimensions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    ColumnMajor,
    RowMajor,
}

impl Layout {
    /// Smallest legal leading dimension for a stored `rows x cols` matrix.
    pub fn min_ld(self, rows: usize, cols: usize) -> usize {
        match self {
            Layout::ColumnMajor => rows.max(1),
            Layout::RowMajor => cols.max(1),
        }
    }

    /// Elements addressed by a stored `rows x cols` matrix with stride `ld`.
    /// `None` when the count overflows `usize`.
    pub fn footprint(self, rows: usize, cols: usize, ld: usize) -> Option<usize> {
        match self {
            Layout::ColumnMajor => column_major_footprint(rows, cols, ld),
            // Row-major rows x cols is column-major cols x rows
            Layout::RowMajor => column_major_footprint(cols, rows, ld),
        }
    }
}

/// Index of a buffer inside its `BufferSet`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One allocated buffer
#[derive(Debug)]
pub struct Buffer {
    name: String,
    role: BufferRole,
    capacity_bytes: u64,
    region: RegionId,
    host: Option<Vec<f32>>,
    released: bool,
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn capacity_elements(&self) -> usize {
        (self.capacity_bytes / ELEMENT_SIZE) as usize
    }

    /// Host copy of the data last uploaded with `upload_initial`
    pub fn host_mirror(&self) -> Option<&[f32]> {
        self.host.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn region(&self) -> RegionId {
        self.region
    }
}

/// A matrix-shaped window onto a buffer.
///
/// Only constructed through `BufferSet::view`, so the footprint is known to
/// fit the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixView {
    buffer: BufferHandle,
    rows: usize,
    cols: usize,
    ld: usize,
    layout: Layout,
    footprint: usize,
}

impl MatrixView {
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn ld(&self) -> usize {
        self.ld
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }
}

/// Owns every buffer used by a pipeline.
#[derive(Debug, Default)]
pub struct BufferSet {
    buffers: Vec<Buffer>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a device region of `capacity_bytes`.
    ///
    /// A failure leaves every previously allocated buffer untouched.
    pub fn allocate<B: GemmBackend>(
        &mut self,
        ctx: &mut ExecutionContext<B>,
        name: impl Into<String>,
        role: BufferRole,
        capacity_bytes: u64,
    ) -> Result<BufferHandle> {
        let name = name.into();
        let fail = |reason: String| PipelineError::Allocation {
            buffer: name.clone(),
            reason,
        };

        if capacity_bytes == 0 {
            return Err(fail("capacity must be greater than zero".to_string()));
        }
        if capacity_bytes % ELEMENT_SIZE != 0 {
            return Err(fail(format!(
                "capacity {} is not a multiple of the {}-byte element size",
                capacity_bytes, ELEMENT_SIZE
            )));
        }
        if self.handle_by_name(&name).is_some() {
            return Err(fail("a buffer with this name already exists".to_string()));
        }

        let region = ctx
            .backend_mut()
            .allocate(capacity_bytes)
            .map_err(|e| fail(e.to_string()))?;

        log::debug!(
            "Allocated buffer '{}' (role {}, {} bytes)",
            name,
            role,
            capacity_bytes
        );

        self.buffers.push(Buffer {
            name,
            role,
            capacity_bytes,
            region,
            host: None,
            released: false,
        });
        Ok(BufferHandle(self.buffers.len() - 1))
    }

    /// Copy host data into the device region and keep it as the re-seed pattern.
    ///
    /// `data` must cover the full capacity.
    pub fn upload_initial<B: GemmBackend>(
        &mut self,
        ctx: &mut ExecutionContext<B>,
        handle: BufferHandle,
        data: &[f32],
    ) -> Result<()> {
        let buffer = self.live(handle)?;
        let host_bytes = data.len() as u64 * ELEMENT_SIZE;
        if host_bytes != buffer.capacity_bytes {
            return Err(PipelineError::Transfer {
                buffer: buffer.name.clone(),
                reason: format!(
                    "host data is {} bytes but buffer capacity is {} bytes",
                    host_bytes, buffer.capacity_bytes
                ),
            });
        }

        ctx.backend_mut()
            .upload(buffer.region, data)
            .map_err(|e| PipelineError::Transfer {
                buffer: buffer.name.clone(),
                reason: e.to_string(),
            })?;

        log::debug!("Uploaded {} bytes to '{}'", host_bytes, buffer.name);
        self.buffers[handle.0].host = Some(data.to_vec());
        Ok(())
    }

    /// Re-upload the host mirror, discarding whatever the device region holds.
    pub fn reseed<B: GemmBackend>(
        &self,
        ctx: &mut ExecutionContext<B>,
        handle: BufferHandle,
    ) -> Result<()> {
        let buffer = self.live(handle)?;
        let host = buffer.host.as_deref().ok_or_else(|| PipelineError::Transfer {
            buffer: buffer.name.clone(),
            reason: "no host data to re-seed from".to_string(),
        })?;

        ctx.backend_mut()
            .upload(buffer.region, host)
            .map_err(|e| PipelineError::Transfer {
                buffer: buffer.name.clone(),
                reason: e.to_string(),
            })?;

        log::debug!("Re-seeded '{}' from host mirror", buffer.name);
        Ok(())
    }

    /// Copy the device region back to the host.
    pub fn download_final<B: GemmBackend>(
        &self,
        ctx: &mut ExecutionContext<B>,
        handle: BufferHandle,
    ) -> Result<Vec<f32>> {
        let buffer = self.live(handle)?;
        let data = ctx
            .backend_mut()
            .download(buffer.region)
            .map_err(|e| PipelineError::Transfer {
                buffer: buffer.name.clone(),
                reason: e.to_string(),
            })?;

        if data.len() != buffer.capacity_elements() {
            return Err(PipelineError::Transfer {
                buffer: buffer.name.clone(),
                reason: format!(
                    "device returned {} elements, expected {}",
                    data.len(),
                    buffer.capacity_elements()
                ),
            });
        }

        log::debug!("Downloaded {} bytes from '{}'", buffer.capacity_bytes, buffer.name);
        Ok(data)
    }

    /// Free the buffer's device region. Releasing twice is an error.
    pub fn release<B: GemmBackend>(
        &mut self,
        ctx: &mut ExecutionContext<B>,
        handle: BufferHandle,
    ) -> Result<()> {
        let buffer = self.live(handle)?;
        ctx.backend_mut()
            .free(buffer.region)
            .map_err(|e| PipelineError::Allocation {
                buffer: buffer.name.clone(),
                reason: format!("release failed: {}", e),
            })?;

        log::debug!("Released buffer '{}'", buffer.name);
        let buffer = &mut self.buffers[handle.0];
        buffer.released = true;
        buffer.host = None;
        Ok(())
    }

    /// Release every buffer that is still live.
    pub fn release_all<B: GemmBackend>(&mut self, ctx: &mut ExecutionContext<B>) -> Result<()> {
        let live: Vec<BufferHandle> = (0..self.buffers.len())
            .map(BufferHandle)
            .filter(|handle| !self.buffers[handle.0].released)
            .collect();
        for handle in live {
            self.release(ctx, handle)?;
        }
        Ok(())
    }

    /// Build a view of `rows x cols` elements with leading dimension `ld`.
    pub fn view(
        &self,
        handle: BufferHandle,
        rows: usize,
        cols: usize,
        ld: usize,
        layout: Layout,
    ) -> Result<MatrixView> {
        let buffer = self.live(handle)?;

        if rows == 0 || cols == 0 {
            return Err(PipelineError::config(format!(
                "view of '{}' has an empty shape {}x{}",
                buffer.name, rows, cols
            )));
        }

        let min_ld = layout.min_ld(rows, cols);
        if ld < min_ld {
            return Err(PipelineError::config(format!(
                "leading dimension {} of '{}' is smaller than {} for a {}x{} {:?} view",
                ld, buffer.name, min_ld, rows, cols, layout
            )));
        }

        let footprint = layout.footprint(rows, cols, ld).ok_or_else(|| {
            PipelineError::config(format!(
                "view {}x{} (ld {}) of '{}' overflows the address space",
                rows, cols, ld, buffer.name
            ))
        })?;
        if footprint > buffer.capacity_elements() {
            return Err(PipelineError::config(format!(
                "view {}x{} (ld {}) of '{}' needs {} elements but capacity is {}",
                rows,
                cols,
                ld,
                buffer.name,
                footprint,
                buffer.capacity_elements()
            )));
        }

        Ok(MatrixView {
            buffer: handle,
            rows,
            cols,
            ld,
            layout,
            footprint,
        })
    }

    /// Look up a buffer, released or not.
    pub fn get(&self, handle: BufferHandle) -> Result<&Buffer> {
        self.buffers.get(handle.0).ok_or_else(|| {
            PipelineError::config(format!("buffer handle {} does not exist", handle.0))
        })
    }

    /// Look up a buffer that has not been released.
    pub fn live(&self, handle: BufferHandle) -> Result<&Buffer> {
        let buffer = self.get(handle)?;
        if buffer.released {
            return Err(PipelineError::UseAfterFree {
                buffer: buffer.name.clone(),
            });
        }
        Ok(buffer)
    }

    pub fn handle_by_name(&self, name: &str) -> Option<BufferHandle> {
        self.buffers
            .iter()
            .position(|b| b.name == name)
            .map(BufferHandle)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BufferHandle, &Buffer)> {
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, b)| (BufferHandle(i), b))
    }

    /// Bytes held by live buffers
    pub fn live_bytes(&self) -> u64 {
        self.buffers
            .iter()
            .filter(|b| !b.released)
            .map(|b| b.capacity_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn context() -> ExecutionContext<CpuBackend> {
        ExecutionContext::new(CpuBackend::with_memory_budget(1024))
    }

    #[test]
    fn test_allocate_and_round_trip() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "a", BufferRole::A, 16).unwrap();

        set.upload_initial(&mut ctx, h, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(set.download_final(&mut ctx, h).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(set.get(h).unwrap().host_mirror(), Some(&[1.0, 2.0, 3.0, 4.0][..]));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let err = set.allocate(&mut ctx, "a", BufferRole::A, 0).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation { .. }));
        assert!(set.is_empty());
    }

    #[test]
    fn test_unaligned_capacity_rejected() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let err = set.allocate(&mut ctx, "a", BufferRole::A, 6).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation { .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        set.allocate(&mut ctx, "a", BufferRole::A, 4).unwrap();
        let err = set.allocate(&mut ctx, "a", BufferRole::B, 4).unwrap_err();
        assert!(matches!(err, PipelineError::Allocation { .. }));
    }

    #[test]
    fn test_upload_length_mismatch() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "c", BufferRole::C, 16).unwrap();
        let err = set.upload_initial(&mut ctx, h, &[1.0; 3]).unwrap_err();
        assert!(matches!(err, PipelineError::Transfer { .. }));
        assert_eq!(ctx.backend().stats().uploads, 0);
        assert!(set.get(h).unwrap().host_mirror().is_none());
    }

    #[test]
    fn test_reseed_restores_host_pattern() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "c", BufferRole::C, 8).unwrap();
        set.upload_initial(&mut ctx, h, &[5.0, 6.0]).unwrap();

        let region = set.get(h).unwrap().region();
        ctx.backend_mut().upload(region, &[0.0, 0.0]).unwrap();
        set.reseed(&mut ctx, h).unwrap();
        assert_eq!(set.download_final(&mut ctx, h).unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_reseed_without_host_data() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "c", BufferRole::C, 8).unwrap();
        assert!(matches!(
            set.reseed(&mut ctx, h).unwrap_err(),
            PipelineError::Transfer { .. }
        ));
    }

    #[test]
    fn test_release_twice_is_use_after_free() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "a", BufferRole::A, 4).unwrap();
        set.release(&mut ctx, h).unwrap();

        let err = set.release(&mut ctx, h).unwrap_err();
        assert!(matches!(err, PipelineError::UseAfterFree { .. }));
        assert!(matches!(
            set.download_final(&mut ctx, h).unwrap_err(),
            PipelineError::UseAfterFree { .. }
        ));
        assert_eq!(ctx.backend().stats().frees, 1);
    }

    #[test]
    fn test_release_all() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let a = set.allocate(&mut ctx, "a", BufferRole::A, 8).unwrap();
        set.allocate(&mut ctx, "b", BufferRole::B, 8).unwrap();
        set.release(&mut ctx, a).unwrap();

        set.release_all(&mut ctx).unwrap();
        assert_eq!(set.live_bytes(), 0);
        assert_eq!(ctx.backend().memory_used(), 0);
    }

    #[test]
    fn test_view_checks_capacity_and_stride() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        // 12 elements
        let h = set.allocate(&mut ctx, "a", BufferRole::A, 48).unwrap();

        let view = set.view(h, 4, 3, 4, Layout::ColumnMajor).unwrap();
        assert_eq!(view.footprint(), 12);

        // Sub-footprint with a wider stride still fits: 5 * 1 + 2 = 7
        assert!(set.view(h, 2, 2, 5, Layout::ColumnMajor).is_ok());

        // Stride below the row count
        assert!(set.view(h, 4, 3, 3, Layout::ColumnMajor).is_err());
        // Row-major needs ld >= cols
        assert!(set.view(h, 3, 4, 3, Layout::RowMajor).is_err());
        // Larger than the allocation
        assert!(set.view(h, 4, 4, 4, Layout::ColumnMajor).is_err());
        assert!(set.view(h, 0, 4, 4, Layout::ColumnMajor).is_err());
    }

    #[test]
    fn test_view_with_overflowing_stride_is_rejected() {
        let mut ctx = context();
        let mut set = BufferSet::new();
        let h = set.allocate(&mut ctx, "a", BufferRole::A, 64).unwrap();

        for layout in [Layout::ColumnMajor, Layout::RowMajor] {
            let err = set.view(h, 2, 2, usize::MAX, layout).unwrap_err();
            assert_eq!(err.kind(), "ConfigurationError", "{:?}", layout);
        }
        assert_eq!(Layout::RowMajor.footprint(3, 2, usize::MAX), None);
    }
}
