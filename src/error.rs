//! Error types for GEMM stage pipelines
//!
//! Two layers: `DeviceError` is what a backend reports, `PipelineError` is
//! what the pipeline surfaces to its caller, tagged with the buffer or stage
//! the failure belongs to.

use thiserror::Error;

/// Failures reported by a device backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device cannot satisfy an allocation request
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// Region id does not name a live allocation
    #[error("unknown device region {0}")]
    UnknownRegion(u64),

    /// Host slice length does not match the device region
    #[error("transfer size mismatch: host has {host} bytes, device region has {device} bytes")]
    SizeMismatch { host: u64, device: u64 },

    /// Backend refused the GEMM parameters (unsupported combination, bad stride)
    #[error("GEMM rejected by backend: {0}")]
    Rejected(String),

    /// Device faulted while executing submitted work
    #[error("device fault: {0}")]
    Fault(String),

    /// No device with the required capability
    #[error("no suitable device found with compute queue support")]
    NoSuitableDevice,

    /// Backend initialization failed (loader, instance, shader)
    #[error("device initialization failed: {0}")]
    InitializationFailed(String),

    /// Vulkan API returned an error
    #[cfg(feature = "vulkan")]
    #[error("Vulkan API error: {0:?}")]
    VulkanApi(ash::vk::Result),
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for DeviceError {
    fn from(result: ash::vk::Result) -> Self {
        DeviceError::VulkanApi(result)
    }
}

/// Errors surfaced by buffer management, stage list construction and execution.
///
/// None of these are retried. A run either completes every stage or the
/// result buffer must be treated as undefined.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad shapes, strides or buffer references, caught before device work
    #[error("configuration error{}: {reason}", stage_suffix(.stage))]
    Configuration { stage: Option<usize>, reason: String },

    /// Device could not reserve a buffer
    #[error("allocation error for buffer '{buffer}': {reason}")]
    Allocation { buffer: String, reason: String },

    /// Host/device copy failed or was mis-sized
    #[error("transfer error for buffer '{buffer}': {reason}")]
    Transfer { buffer: String, reason: String },

    /// Device rejected or faulted on a stage
    #[error("compute error at stage {stage}: {source}")]
    Compute {
        stage: usize,
        #[source]
        source: DeviceError,
    },

    /// Buffer used after it was released
    #[error("buffer '{buffer}' used after release")]
    UseAfterFree { buffer: String },

    /// Execution context could not be created
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Pipeline description file could not be read
    #[error("failed to read pipeline description: {0}")]
    Io(#[from] std::io::Error),

    /// Pipeline description file is not valid JSON for the schema
    #[error("failed to parse pipeline description: {0}")]
    Parse(#[from] serde_json::Error),
}

fn stage_suffix(stage: &Option<usize>) -> String {
    match stage {
        Some(index) => format!(" at stage {}", index),
        None => String::new(),
    }
}

impl PipelineError {
    /// Configuration error attached to one stage.
    pub fn config_at(stage: usize, reason: impl Into<String>) -> Self {
        PipelineError::Configuration {
            stage: Some(stage),
            reason: reason.into(),
        }
    }

    /// Configuration error not tied to a stage.
    pub fn config(reason: impl Into<String>) -> Self {
        PipelineError::Configuration {
            stage: None,
            reason: reason.into(),
        }
    }

    /// Short, stable name of the error kind (used in CLI output).
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration { .. } => "ConfigurationError",
            PipelineError::Allocation { .. } => "AllocationError",
            PipelineError::Transfer { .. } => "TransferError",
            PipelineError::Compute { .. } => "ComputeError",
            PipelineError::UseAfterFree { .. } => "UseAfterFree",
            PipelineError::Device(_) => "DeviceError",
            PipelineError::Io(_) | PipelineError::Parse(_) => "ConfigurationError",
        }
    }

    /// Stage index the error belongs to, if any.
    pub fn stage(&self) -> Option<usize> {
        match self {
            PipelineError::Configuration { stage, .. } => *stage,
            PipelineError::Compute { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display_names_stage() {
        let err = PipelineError::config_at(2, "m must be > 0");
        assert_eq!(err.to_string(), "configuration error at stage 2: m must be > 0");
        assert_eq!(err.kind(), "ConfigurationError");
        assert_eq!(err.stage(), Some(2));
    }

    #[test]
    fn test_configuration_without_stage() {
        let err = PipelineError::config("stage list is empty");
        assert_eq!(err.to_string(), "configuration error: stage list is empty");
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn test_compute_error_carries_source() {
        let err = PipelineError::Compute {
            stage: 4,
            source: DeviceError::Fault("lost device".to_string()),
        };
        assert!(err.to_string().contains("stage 4"));
        assert!(err.to_string().contains("lost device"));
        assert_eq!(err.kind(), "ComputeError");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = DeviceError::OutOfMemory { requested: 64, available: 32 };
        assert!(err.to_string().contains("requested 64 bytes"));
    }
}
