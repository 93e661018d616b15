//! Execution context: one backend bound to one device

use crate::backend::GemmBackend;

/// Owns the backend for the lifetime of a pipeline.
///
/// Created once before buffers are allocated and dropped after they are
/// released. Not shared between pipelines.
pub struct ExecutionContext<B: GemmBackend> {
    backend: B,
    device_name: String,
}

impl<B: GemmBackend> ExecutionContext<B> {
    pub fn new(backend: B) -> Self {
        let device_name = backend.device_name();
        log::info!(
            "Execution context bound to '{}' ({} bytes available)",
            device_name,
            backend.available_memory()
        );
        Self {
            backend,
            device_name,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Tear down the context and hand back the backend.
    pub fn into_backend(self) -> B {
        log::debug!("Releasing execution context for '{}'", self.device_name);
        self.backend
    }
}
