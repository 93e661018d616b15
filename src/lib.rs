//! GEMM stage pipelines
//!
//! Runs a fixed sequence of dense single-precision matrix multiplies on one
//! accelerator. Each stage picks its own shapes, leading dimensions,
//! transposition and accumulation behaviour, and all stages share a small
//! set of device buffers allocated once up front.
//!
//! # Architecture
//!
//! ```text
//! ExecutionContext<B: GemmBackend>   one device, owned by the caller
//!     │
//!     ├── BufferSet                  allocate / upload_initial / download_final / release
//!     │      └── MatrixView          shape + stride checked against capacity
//!     │
//!     ├── StageList                  built once, validated before device work
//!     │      └── ValidatedStage      views, hazard flag, column-major lowering
//!     │
//!     └── PipelineExecutor::run      strict order, barriers on aliasing, one final download
//! ```
//!
//! # Example
//!
//! ```rust
//! use gemm_stages::{
//!     BufferRole, BufferSet, CpuBackend, ExecutionContext, Layout, PipelineExecutor, Stage,
//!     StageListBuilder,
//! };
//!
//! # fn main() -> gemm_stages::Result<()> {
//! let mut ctx = ExecutionContext::new(CpuBackend::new());
//! let mut buffers = BufferSet::new();
//! let a = buffers.allocate(&mut ctx, "a", BufferRole::A, 4 * 4)?;
//! let b = buffers.allocate(&mut ctx, "b", BufferRole::B, 4 * 4)?;
//! let c = buffers.allocate(&mut ctx, "c", BufferRole::C, 4 * 4)?;
//!
//! let stages = StageListBuilder::new(Layout::RowMajor)
//!     .push(Stage::new(2, 2, 2).operands(a, b, c))
//!     .build(&buffers)?;
//!
//! buffers.upload_initial(&mut ctx, a, &[1.0, 2.0, 3.0, 4.0])?;
//! buffers.upload_initial(&mut ctx, b, &[5.0, 6.0, 7.0, 8.0])?;
//! buffers.upload_initial(&mut ctx, c, &[0.0; 4])?;
//!
//! let report = PipelineExecutor::new().run(&stages, &buffers, &mut ctx)?;
//! assert_eq!(report.output(), &[19.0, 22.0, 43.0, 50.0]);
//!
//! buffers.release_all(&mut ctx)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer_set;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod presets;
pub mod stage;

pub use backend::{BackendStats, CpuBackend, GemmBackend, GemmCall, RegionId, Transpose};
#[cfg(feature = "vulkan")]
pub use backend::VulkanBackend;
pub use buffer_set::{Buffer, BufferHandle, BufferRole, BufferSet, Layout, MatrixView};
pub use config::{BufferSpec, Fill, PipelineDescription, PreparedPipeline, StageSpec};
pub use context::ExecutionContext;
pub use error::{DeviceError, PipelineError, Result};
pub use executor::{output_digest, ExecutorOptions, PipelineExecutor, RunReport, StageRecord};
pub use stage::{ResultSeed, Stage, StageList, StageListBuilder, ValidatedStage};
