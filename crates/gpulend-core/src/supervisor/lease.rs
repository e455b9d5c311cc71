use std::sync::Arc;

use super::backend::{SandboxBackend, SandboxHandle};

/// Owns a created sandbox until it is torn down. Dropping an unreleased
/// lease (task aborted, panic) schedules the teardown on the runtime.
pub struct SandboxLease {
    backend: Arc<dyn SandboxBackend>,
    handle: SandboxHandle,
    released: bool,
}

impl SandboxLease {
    pub fn new(backend: Arc<dyn SandboxBackend>, handle: SandboxHandle) -> Self {
        Self {
            backend,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub async fn release(mut self) {
        self.released = true;
        teardown(self.backend.as_ref(), &self.handle).await;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { teardown(backend.as_ref(), &handle).await });
            }
            Err(_) => tracing::warn!(
                sandbox = %self.handle.id,
                "sandbox lease dropped outside a runtime; left for the startup sweep"
            ),
        }
    }
}

pub(crate) async fn teardown(backend: &dyn SandboxBackend, handle: &SandboxHandle) {
    if let Err(e) = backend.teardown(handle).await {
        tracing::warn!(sandbox = %handle.id, error = %e, "sandbox teardown failed");
    }
}
