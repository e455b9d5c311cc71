use gpulend_ledger::JobId;

/// Faults raised by a sandbox backend or by executor-side bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("sandbox command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("payload could not be staged: {0}")]
    Payload(String),

    #[error("workspace archive failed: {0}")]
    Archive(String),

    #[error("unknown sandbox {0}")]
    UnknownSandbox(String),

    #[error("job {0} is not reserved on this peer")]
    NotReserved(JobId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
