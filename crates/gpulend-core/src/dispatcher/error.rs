use gpulend_ledger::JobId;

use crate::matcher::MatchError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no peer currently meets the job's requirement")]
    NoCandidate,

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("dispatcher is shutting down")]
    Stopped,
}

impl From<MatchError> for DispatchError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::NoCandidate => DispatchError::NoCandidate,
        }
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
