use std::time::Duration;

use chrono::{DateTime, Utc};
use gpulend_ledger::{JobId, Outcome, PeerId, ResourceUsage};
use serde::{Deserialize, Serialize};

use super::capability::ResourceRequirement;

/// What to run. Opaque to the broker; interpreted by the executor's
/// sandbox backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    /// A container image, optionally with a command overriding its entrypoint.
    Image {
        image: String,
        #[serde(default)]
        command: Option<String>,
    },
    /// A file or directory (local path, `file://` or `http(s)://` URI) made
    /// available under `/workspace` and run with `command` in the default image.
    Blob { uri: String, command: String },
}

impl PayloadRef {
    pub fn image(image: impl Into<String>) -> Self {
        PayloadRef::Image {
            image: image.into(),
            command: None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PayloadRef::Image { image, .. } => format!("image:{image}"),
            PayloadRef::Blob { uri, .. } => format!("blob:{uri}"),
        }
    }
}

/// A unit of work as submitted. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub requester: PeerId,
    pub requirement: ResourceRequirement,
    pub payload: PayloadRef,
    pub time_budget_secs: u64,
    pub submitted_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(
        requester: PeerId,
        requirement: ResourceRequirement,
        payload: PayloadRef,
        time_budget: Duration,
    ) -> Self {
        Self {
            requester,
            requirement,
            payload,
            time_budget_secs: time_budget.as_secs(),
            submitted_at: Utc::now(),
        }
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

/// Lifecycle state of a [`JobSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Offered,
    Accepted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Declined,
    PeerLost,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Offered => "offered",
            JobState::Accepted => "accepted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Declined => "declined",
            JobState::PeerLost => "peer_lost",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal state for a final outcome.
    pub fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => JobState::Succeeded,
            Outcome::Failed { .. } => JobState::Failed,
            Outcome::TimedOut => JobState::TimedOut,
            Outcome::Declined => JobState::Declined,
            Outcome::PeerLost => JobState::PeerLost,
            Outcome::Cancelled => JobState::Cancelled,
        }
    }

    /// Allowed moves. `PeerLost → Offered` is the single re-dispatch edge;
    /// any live state may be cancelled.
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Created, Offered) => true,
            (Created, Declined) => true,
            (Offered, Offered | Accepted | Declined) => true,
            (Accepted, Running) => true,
            (Accepted | Running, Succeeded | Failed | TimedOut | PeerLost) => true,
            (PeerLost, Offered) => true,
            (Created | Offered | Accepted | Running | PeerLost, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid transition for job {job_id}: {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: JobState,
    pub peer: Option<PeerId>,
    pub at: DateTime<Utc>,
}

/// Captured output of an execution, truncated by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Packed workspace of a finished job, held by its executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Hex sha256 of the zip archive.
    pub sha256: String,
    pub size_bytes: u64,
    /// Where the executor serves it, when it runs an API.
    #[serde(default)]
    pub url: Option<String>,
}

/// Final result of a session as seen by the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub outcome: Outcome,
    /// Executor the outcome is attributed to.
    pub executor: PeerId,
    pub reason: Option<String>,
    pub output_ref: Option<String>,
    pub consumed: ResourceUsage,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Option<ExecutionLogs>,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
}

/// Submitter-side lifecycle of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSession {
    pub job_id: JobId,
    pub request: JobRequest,
    /// The single peer currently assigned, if any.
    pub assigned: Option<PeerId>,
    pub state: JobState,
    pub transitions: Vec<Transition>,
    pub outcome: Option<JobOutcome>,
}

impl JobSession {
    pub fn new(job_id: JobId, request: JobRequest) -> Self {
        Self {
            job_id,
            request,
            assigned: None,
            state: JobState::Created,
            transitions: vec![Transition {
                state: JobState::Created,
                peer: None,
                at: Utc::now(),
            }],
            outcome: None,
        }
    }

    /// Move to `next`, reassigning the session to `peer` when given.
    pub fn advance(&mut self, next: JobState, peer: Option<&PeerId>) -> Result<(), TransitionError> {
        if self.is_finished() || !self.state.can_advance_to(next) {
            return Err(TransitionError {
                job_id: self.job_id.clone(),
                from: self.state,
                to: next,
            });
        }
        if let Some(peer) = peer {
            self.assigned = Some(peer.clone());
        }
        self.state = next;
        self.transitions.push(Transition {
            state: next,
            peer: self.assigned.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Enter the terminal state matching `outcome` and attach it.
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<(), TransitionError> {
        let state = JobState::from_outcome(&outcome.outcome);
        if self.state == state && !self.is_finished() {
            // Already marked (PeerLost with no re-dispatch left).
            self.assigned = Some(outcome.executor.clone());
        } else {
            self.advance(state, Some(&outcome.executor))?;
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Peers this session was offered to, in order.
    pub fn offered_peers(&self) -> Vec<PeerId> {
        self.transitions
            .iter()
            .filter(|t| t.state == JobState::Offered)
            .filter_map(|t| t.peer.clone())
            .collect()
    }
}

/// Broadcast to front ends on every session transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub peer: Option<PeerId>,
    pub at: DateTime<Utc>,
}
