//! Error types for gpulend-ledger

use thiserror::Error;

use crate::ids::JobId;

/// Errors produced by ledger backends.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A terminal entry already exists for this job. Signals a logic error
    /// upstream: the ledger never overwrites.
    #[error("ledger entry already recorded for job {job_id}")]
    DuplicateEntry { job_id: JobId },

    /// An execution mark already exists for this job.
    #[error("execution already opened for job {job_id}")]
    DuplicateExecution { job_id: JobId },

    /// Database connection error
    #[error("ledger connection failed: {0}")]
    Connection(String),

    /// Backend query error
    #[error("ledger backend error: {0}")]
    Backend(String),

    /// Stored row could not be mapped back to a domain value
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

impl From<surrealdb::Error> for LedgerError {
    fn from(err: surrealdb::Error) -> Self {
        LedgerError::Backend(err.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
