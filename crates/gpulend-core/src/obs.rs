//! Structured lifecycle events for jobs, peers, and sandboxes.
//!
//! Every event carries an `event` field (`job.submitted`, `peer.lost`, ...)
//! so JSON log pipelines can filter on it. Per-job spans come from
//! [`job_span`] and are attached to spawned tasks with
//! `tracing::Instrument`.

use gpulend_ledger::{JobId, Outcome, PeerId};
use tracing::{info, warn, Span};

/// Which side of a job the span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    Requester,
    Executor,
}

impl JobRole {
    fn as_str(self) -> &'static str {
        match self {
            JobRole::Requester => "requester",
            JobRole::Executor => "executor",
        }
    }
}

/// Span tagged with the job id, for instrumenting a job's driver task.
pub fn job_span(job_id: &JobId, role: JobRole) -> Span {
    tracing::info_span!("gpulend.job", job_id = %job_id, role = role.as_str())
}

pub fn emit_job_submitted(job_id: &JobId, requester: &PeerId, first_candidate: &PeerId) {
    info!(
        event = "job.submitted",
        job_id = %job_id,
        requester = %requester.short(),
        candidate = %first_candidate.short(),
    );
}

pub fn emit_job_transition(job_id: &JobId, state: &str, peer: Option<&PeerId>) {
    info!(
        event = "job.transition",
        job_id = %job_id,
        state = state,
        peer = %peer.map(PeerId::short).unwrap_or("-"),
    );
}

/// Emit event: a job reached its terminal outcome.
pub fn emit_job_finished(job_id: &JobId, executor: &PeerId, outcome: &Outcome, duration_ms: u64) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        executor = %executor.short(),
        outcome = %outcome,
        duration_ms = duration_ms,
        success = outcome.is_success(),
    );
}

pub fn emit_offer_declined(job_id: &JobId, peer: &PeerId, reason: &str) {
    info!(event = "offer.declined", job_id = %job_id, peer = %peer.short(), reason = reason);
}

pub fn emit_peer_lost(job_id: &JobId, peer: &PeerId, redispatch: bool) {
    warn!(event = "peer.lost", job_id = %job_id, peer = %peer.short(), redispatch = redispatch);
}

pub fn emit_peer_evicted(peer: &PeerId, silent_ms: u64) {
    info!(event = "peer.evicted", peer = %peer.short(), silent_ms = silent_ms);
}

pub fn emit_sandbox_killed(job_id: &JobId, reason: &str) {
    warn!(event = "sandbox.killed", job_id = %job_id, reason = reason);
}

/// Emit event: ledger write failed after a terminal outcome (error level).
pub fn emit_ledger_write_failed(job_id: &JobId, error: &dyn std::fmt::Display) {
    tracing::error!(event = "ledger.write_failed", job_id = %job_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_span_enters() {
        let span = job_span(&JobId::from("job-1"), JobRole::Executor);
        let _entered = span.entered();
        emit_job_transition(&JobId::from("job-1"), "running", None);
    }
}
