//! Top-level error taxonomy for gpulend-core.

use crate::config::ConfigError;
use crate::dispatcher::DispatchError;
use crate::identity::IdentityError;
use crate::registry::RegistryError;
use crate::supervisor::SandboxError;
use crate::transport::TransportError;
use gpulend_ledger::LedgerError;

/// Errors surfaced by node-level operations.
#[derive(Debug, thiserror::Error)]
pub enum GpulendError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gpulend-core operations.
pub type Result<T> = std::result::Result<T, GpulendError>;

#[cfg(test)]
mod tests {
    use super::*;
    use gpulend_ledger::JobId;

    #[test]
    fn ledger_errors_convert_and_display() {
        let err: GpulendError = LedgerError::DuplicateEntry {
            job_id: JobId::from("job-9"),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("ledger error"));
        assert!(msg.contains("job-9"));
    }

    #[test]
    fn dispatch_no_candidate_display() {
        let err: GpulendError = DispatchError::NoCandidate.into();
        assert!(err.to_string().contains("no peer"));
    }
}
