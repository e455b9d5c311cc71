//! Ledger record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, PeerId};

/// Failure class reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SandboxError,
    ResourceViolation,
    PayloadError,
    InternalError,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::SandboxError => "sandbox_error",
            ErrorClass::ResourceViolation => "resource_violation",
            ErrorClass::PayloadError => "payload_error",
            ErrorClass::InternalError => "internal_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sandbox_error" => Some(ErrorClass::SandboxError),
            "resource_violation" => Some(ErrorClass::ResourceViolation),
            "payload_error" => Some(ErrorClass::PayloadError),
            "internal_error" => Some(ErrorClass::InternalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { class: ErrorClass },
    TimedOut,
    Declined,
    PeerLost,
    Cancelled,
}

impl Outcome {
    /// Stable label used for storage and display.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed { .. } => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::Declined => "declined",
            Outcome::PeerLost => "peer_lost",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Outcome::Failed { class } => Some(*class),
            _ => None,
        }
    }

    /// Rebuild an outcome from its stored label and optional error class.
    pub fn from_parts(label: &str, class: Option<&str>) -> Option<Self> {
        Some(match label {
            "succeeded" => Outcome::Succeeded,
            "failed" => Outcome::Failed {
                class: ErrorClass::parse(class?)?,
            },
            "timed_out" => Outcome::TimedOut,
            "declined" => Outcome::Declined,
            "peer_lost" => Outcome::PeerLost,
            "cancelled" => Outcome::Cancelled,
            _ => return None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Failed { class } => write!(f, "failed({class})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Resources a job actually consumed, as measured by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_vram_mb: u64,
    pub peak_memory_mb: u64,
    pub cpu_time_ms: u64,
}

impl ResourceUsage {
    /// Component-wise maximum, used to track peaks across samples.
    pub fn max(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            peak_vram_mb: self.peak_vram_mb.max(other.peak_vram_mb),
            peak_memory_mb: self.peak_memory_mb.max(other.peak_memory_mb),
            cpu_time_ms: self.cpu_time_ms.max(other.cpu_time_ms),
        }
    }
}

/// Terminal record for one job. Append-only: never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub requester: PeerId,
    pub executor: PeerId,
    pub outcome: Outcome,
    /// Human-readable reason (error detail, decline reason, ...)
    pub reason: Option<String>,
    pub output_ref: Option<String>,
    pub consumed: ResourceUsage,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Executor-side mark written when a job is accepted and closed when its
/// sandbox is gone. Open marks without a close identify orphans after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenExecution {
    pub job_id: JobId,
    pub requester: PeerId,
    pub executor: PeerId,
    pub opened_at: DateTime<Utc>,
}

impl OpenExecution {
    pub fn new(job_id: JobId, requester: PeerId, executor: PeerId) -> Self {
        Self {
            job_id,
            requester,
            executor,
            opened_at: Utc::now(),
        }
    }
}

/// An execution mark together with its close state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution: OpenExecution,
    pub outcome: Option<Outcome>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Outcome counts for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub declined: u64,
    pub peer_lost: u64,
    pub cancelled: u64,
}

impl LedgerSummary {
    pub fn tally<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut summary = LedgerSummary::default();
        for entry in entries {
            summary.total += 1;
            match entry.outcome {
                Outcome::Succeeded => summary.succeeded += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::TimedOut => summary.timed_out += 1,
                Outcome::Declined => summary.declined += 1,
                Outcome::PeerLost => summary.peer_lost += 1,
                Outcome::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}
