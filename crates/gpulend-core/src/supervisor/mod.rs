//! Execution Supervisor.
//!
//! Runs on the executing peer. `accept` atomically reserves the offered
//! resources against the capability this node last advertised (whichever of
//! that and a fresh sample is lower); `run` creates the sandbox and drives it
//! under a hard time budget and resource ceiling; `cancel` is best-effort and
//! idempotent. Every created sandbox is held by a [`SandboxLease`], so
//! teardown happens on every exit path, and sandboxes left by a crashed
//! process are swept by [`Supervisor::recover_orphans`] at startup.
//!
//! Each execution emits progress pings while it runs and exactly one
//! terminal report when it ends. Workspaces packed by the backend are kept
//! on a bounded shelf and served to the requester through
//! [`Supervisor::artifact`].

mod admission;
mod archive;
mod backend;
mod error;
mod lease;
mod podman;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpulend_ledger::{ErrorClass, JobId, Ledger, OpenExecution, Outcome, PeerId, ResourceUsage};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::SupervisorConfig;
use crate::domain::{ArtifactRef, Capability, ExecutionLogs};
use crate::metrics::METRICS;
use crate::obs::{self, JobRole};
use crate::probe::CapabilityProbe;
use crate::transport::{Messenger, RetryPolicy};
use crate::wire::{JobOffer, OfferResponse, ProgressPing, TerminalReport, WireMessage};

pub use admission::{Admission, Reservation};
pub use archive::{pack_workspace, stage_payload, Artifact, REQUIREMENTS_FILE};
pub use backend::{
    sandbox_name, SandboxBackend, SandboxExit, SandboxHandle, SandboxLimits, SandboxSpec,
    SandboxStatus, JOB_LABEL,
};
pub use error::{SandboxError, SandboxResult};
pub use lease::SandboxLease;
pub use podman::{find_podman, PodmanBackend};

/// How many finished job ids are remembered to refuse late duplicate offers.
const FINISHED_MEMORY: usize = 1024;

const ORPHAN_REASON: &str = "orphaned by supervisor restart";

enum Slot {
    Reserved {
        offer: JobOffer,
    },
    Running {
        requester: PeerId,
        cancel: watch::Sender<bool>,
        task: Option<JoinHandle<()>>,
    },
}

impl Slot {
    fn requester(&self) -> &PeerId {
        match self {
            Slot::Reserved { offer } => &offer.requester,
            Slot::Running { requester, .. } => requester,
        }
    }
}

/// Packed workspaces of finished jobs, oldest first.
#[derive(Default)]
struct ArtifactShelf {
    entries: VecDeque<(JobId, Artifact)>,
}

impl ArtifactShelf {
    /// Keep `artifact`, returning whatever no longer fits in `capacity`.
    fn put(&mut self, job_id: JobId, artifact: Artifact, capacity: usize) -> Vec<Artifact> {
        let mut evicted = Vec::new();
        if let Some(pos) = self.entries.iter().position(|(id, _)| id == &job_id) {
            if let Some((_, old)) = self.entries.remove(pos) {
                if old.path != artifact.path {
                    evicted.push(old);
                }
            }
        }
        self.entries.push_back((job_id, artifact));
        while self.entries.len() > capacity {
            match self.entries.pop_front() {
                Some((_, old)) => evicted.push(old),
                None => break,
            }
        }
        evicted
    }

    fn get(&self, job_id: &JobId) -> Option<&Artifact> {
        self.entries.iter().find(|(id, _)| id == job_id).map(|(_, a)| a)
    }
}

#[derive(Default)]
struct State {
    admission: Admission,
    jobs: HashMap<JobId, Slot>,
    finished: HashSet<JobId>,
    finished_order: VecDeque<JobId>,
    last_reported: Option<Capability>,
    artifacts: ArtifactShelf,
}

impl State {
    fn mark_finished(&mut self, job_id: &JobId) {
        if self.finished.insert(job_id.clone()) {
            self.finished_order.push_back(job_id.clone());
            if self.finished_order.len() > FINISHED_MEMORY {
                if let Some(old) = self.finished_order.pop_front() {
                    self.finished.remove(&old);
                }
            }
        }
    }

    /// Drop the job's slot and reservation. Returns the removed slot.
    fn retire(&mut self, job_id: &JobId) -> Option<Slot> {
        self.admission.release(job_id);
        self.mark_finished(job_id);
        self.jobs.remove(job_id)
    }
}

/// How one execution ended, before it is reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub output_ref: Option<String>,
    pub consumed: ResourceUsage,
    pub logs: Option<ExecutionLogs>,
    pub artifact: Option<Artifact>,
}

impl Execution {
    fn ended(outcome: Outcome, detail: impl Into<String>, consumed: ResourceUsage) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
            output_ref: None,
            consumed,
            logs: None,
            artifact: None,
        }
    }

    fn failed(class: ErrorClass, detail: impl Into<String>, consumed: ResourceUsage) -> Self {
        Self::ended(Outcome::Failed { class }, detail, consumed)
    }
}

/// Result of the startup orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub sandboxes_removed: usize,
    pub executions_closed: usize,
}

struct Inner {
    local: PeerId,
    config: SupervisorConfig,
    backend: Arc<dyn SandboxBackend>,
    probe: Arc<dyn CapabilityProbe>,
    ledger: Arc<dyn Ledger>,
    messenger: Messenger,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        backend: Arc<dyn SandboxBackend>,
        probe: Arc<dyn CapabilityProbe>,
        ledger: Arc<dyn Ledger>,
        messenger: Messenger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local: messenger.peer_id().clone(),
                config,
                backend,
                probe,
                ledger,
                messenger,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.inner.backend
    }

    /// Fresh hardware sample combined with sandbox availability and the
    /// current slot usage.
    pub async fn local_capability(&self) -> Capability {
        let mut cap = self.inner.probe.sample().await;
        cap.sandbox_available = self.inner.backend.is_available().await;
        cap.max_concurrent_jobs = self.inner.config.max_concurrent_jobs;
        cap.active_jobs = self.inner.state.lock().await.admission.active();
        cap
    }

    /// Record what the reporter last advertised; admission never promises
    /// more than this.
    pub async fn note_reported(&self, capability: Capability) {
        self.inner.state.lock().await.last_reported = Some(capability);
    }

    pub async fn active_jobs(&self) -> u32 {
        self.inner.state.lock().await.admission.active()
    }

    /// Packed workspace of a finished job, while it is still kept.
    pub async fn artifact(&self, job_id: &JobId) -> Option<Artifact> {
        self.inner.state.lock().await.artifacts.get(job_id).cloned()
    }

    /// Decide on an offer. A duplicate offer for a job already held here is
    /// accepted again without a second reservation.
    pub async fn accept(&self, offer: JobOffer) -> OfferResponse {
        let job_id = offer.job_id.clone();
        if let Some(resp) = self.duplicate_answer(&offer).await {
            return resp;
        }
        if offer.time_budget_secs == 0 {
            return OfferResponse::decline(job_id, "empty time budget");
        }

        let fresh = self.local_capability().await;
        {
            let mut st = self.inner.state.lock().await;
            if st.jobs.contains_key(&job_id) || st.finished.contains(&job_id) {
                drop(st);
                return self
                    .duplicate_answer(&offer)
                    .await
                    .unwrap_or_else(|| OfferResponse::decline(job_id, "job already handled"));
            }
            let available = match &st.last_reported {
                Some(reported) => reported.conservative(&fresh),
                None => fresh,
            };
            if let Err(reason) = st.admission.try_reserve(
                &job_id,
                &offer.requester,
                &offer.requirement,
                &available,
            ) {
                tracing::info!(job_id = %job_id, reason = %reason, "declining offer");
                return OfferResponse::decline(job_id, reason);
            }
            st.jobs.insert(job_id.clone(), Slot::Reserved { offer: offer.clone() });
        }

        let mark = OpenExecution::new(job_id.clone(), offer.requester.clone(), self.inner.local.clone());
        if let Err(e) = self.inner.ledger.open_execution(mark).await {
            tracing::error!(job_id = %job_id, error = %e, "could not open execution mark");
            self.inner.state.lock().await.retire(&job_id);
            return OfferResponse::decline(job_id, "executor ledger unavailable");
        }

        let inner = Arc::clone(&self.inner);
        let expiring = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.start_timeout()).await;
            inner.expire_reservation(&expiring).await;
        });

        tracing::info!(
            event = "offer.accepted",
            job_id = %job_id,
            requester = %offer.requester.short(),
            vram_mb = offer.requirement.min_vram_mb,
        );
        OfferResponse::accept(job_id)
    }

    async fn duplicate_answer(&self, offer: &JobOffer) -> Option<OfferResponse> {
        let st = self.inner.state.lock().await;
        let job_id = offer.job_id.clone();
        if let Some(slot) = st.jobs.get(&job_id) {
            return Some(if slot.requester() == &offer.requester {
                OfferResponse::accept(job_id)
            } else {
                OfferResponse::decline(job_id, "job id already in use")
            });
        }
        if st.finished.contains(&job_id) {
            return Some(OfferResponse::decline(job_id, "job already finished on this peer"));
        }
        None
    }

    /// Start a reserved job. Repeated starts from the requester are no-ops.
    pub async fn run(&self, job_id: &JobId, from: &PeerId) -> SandboxResult<()> {
        let mut st = self.inner.state.lock().await;
        let offer = match st.jobs.remove(job_id) {
            Some(Slot::Reserved { offer }) if &offer.requester == from => offer,
            Some(slot) => {
                let duplicate = matches!(slot, Slot::Running { .. }) && slot.requester() == from;
                st.jobs.insert(job_id.clone(), slot);
                return if duplicate {
                    Ok(())
                } else {
                    Err(SandboxError::NotReserved(job_id.clone()))
                };
            }
            None => return Err(SandboxError::NotReserved(job_id.clone())),
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let span = obs::job_span(job_id, JobRole::Executor);
        let task = tokio::spawn(inner.execute(offer.clone(), cancel_rx).instrument(span));
        st.jobs.insert(
            job_id.clone(),
            Slot::Running {
                requester: offer.requester,
                cancel: cancel_tx,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Best-effort cancel. Unknown and finished jobs are a no-op.
    pub async fn cancel(&self, job_id: &JobId, from: &PeerId) {
        let mut st = self.inner.state.lock().await;
        match st.jobs.get(job_id) {
            None => {
                tracing::debug!(job_id = %job_id, "cancel for unknown or finished job ignored");
            }
            Some(slot) if slot.requester() != from => {
                tracing::warn!(job_id = %job_id, from = %from.short(), "cancel from non-requester ignored");
            }
            Some(Slot::Running { cancel, .. }) => {
                let _ = cancel.send(true);
            }
            Some(Slot::Reserved { .. }) => {
                st.retire(job_id);
                drop(st);
                self.inner.close_execution(job_id, Outcome::Cancelled).await;
                tracing::info!(job_id = %job_id, "reservation cancelled before start");
            }
        }
    }

    /// Tear down sandboxes left by a previous process and close their open
    /// execution marks as failed.
    pub async fn recover_orphans(&self) -> crate::Result<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();
        let sandboxes = match inner.backend.list_sandboxes().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "could not list sandboxes for the orphan sweep");
                Vec::new()
            }
        };
        for sandbox in &sandboxes {
            let _ = inner.backend.kill(sandbox).await;
            lease::teardown(inner.backend.as_ref(), sandbox).await;
            report.sandboxes_removed += 1;
        }
        for open in inner.ledger.open_executions().await? {
            if open.executor != inner.local {
                continue;
            }
            let closed = inner
                .ledger
                .close_execution(
                    &open.job_id,
                    Outcome::Failed {
                        class: ErrorClass::InternalError,
                    },
                )
                .await?;
            if closed {
                tracing::warn!(job_id = %open.job_id, reason = ORPHAN_REASON, "closed orphaned execution");
                report.executions_closed += 1;
            }
        }
        if report != RecoveryReport::default() {
            tracing::info!(
                sandboxes = report.sandboxes_removed,
                executions = report.executions_closed,
                "orphan sweep finished"
            );
        }
        Ok(report)
    }

    /// Cancel every running job and wait (bounded) for their reports.
    pub async fn shutdown(&self, wait: Duration) {
        let mut tasks = Vec::new();
        let mut reserved = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            for (job_id, slot) in st.jobs.iter_mut() {
                match slot {
                    Slot::Running { cancel, task, .. } => {
                        let _ = cancel.send(true);
                        tasks.extend(task.take());
                    }
                    Slot::Reserved { .. } => reserved.push(job_id.clone()),
                }
            }
            for job_id in &reserved {
                st.retire(job_id);
            }
        }
        for job_id in &reserved {
            self.inner.close_execution(job_id, Outcome::Cancelled).await;
        }
        if tokio::time::timeout(wait, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("executions still running at shutdown; leaving them to the orphan sweep");
        }
    }
}

impl Inner {
    async fn close_execution(&self, job_id: &JobId, outcome: Outcome) {
        if let Err(e) = self.ledger.close_execution(job_id, outcome).await {
            tracing::error!(job_id = %job_id, error = %e, "could not close execution mark");
        }
    }

    async fn expire_reservation(&self, job_id: &JobId) {
        let expired = {
            let mut st = self.state.lock().await;
            if matches!(st.jobs.get(job_id), Some(Slot::Reserved { .. })) {
                st.retire(job_id);
                true
            } else {
                false
            }
        };
        if expired {
            tracing::info!(job_id = %job_id, "reservation expired before start");
            self.close_execution(job_id, Outcome::Cancelled).await;
        }
    }

    async fn execute(self: Arc<Self>, offer: JobOffer, cancel: watch::Receiver<bool>) {
        let started = Instant::now();
        let spec = SandboxSpec::for_job(
            offer.job_id.clone(),
            &offer.payload,
            &offer.requirement,
            &self.config,
        );

        let execution = match self.backend.create_sandbox(&spec).await {
            Ok(handle) => {
                let lease = SandboxLease::new(Arc::clone(&self.backend), handle);
                let execution = self.supervise(&offer, &spec, lease.handle(), cancel).await;
                lease.release().await;
                execution
            }
            Err(SandboxError::Payload(detail)) => {
                Execution::failed(ErrorClass::PayloadError, detail, ResourceUsage::default())
            }
            Err(e) => Execution::failed(ErrorClass::SandboxError, e.to_string(), ResourceUsage::default()),
        };

        self.state.lock().await.retire(&offer.job_id);
        self.close_execution(&offer.job_id, execution.outcome).await;
        let artifact = match execution.artifact {
            Some(artifact) => Some(self.shelve(&offer.job_id, artifact).await),
            None => None,
        };

        let report = TerminalReport {
            job_id: offer.job_id.clone(),
            outcome: execution.outcome,
            output_ref: execution.output_ref,
            detail: execution.detail,
            consumed: execution.consumed,
            duration_ms: started.elapsed().as_millis() as u64,
            logs: execution.logs,
            artifact,
        };
        tracing::info!(
            event = "execution.finished",
            job_id = %offer.job_id,
            outcome = %report.outcome,
            duration_ms = report.duration_ms,
        );
        let policy = RetryPolicy {
            attempts: self.config.report_attempts,
            backoff_base: Duration::from_millis(self.config.report_backoff_ms),
        };
        if let Err(e) = self
            .messenger
            .send_with_retry(&offer.reply_to, &WireMessage::Terminal(report), policy)
            .await
        {
            tracing::warn!(
                job_id = %offer.job_id,
                error = %e,
                "terminal report undeliverable; requester will see the peer as lost"
            );
        }
    }

    /// Keep a packed workspace for download and describe it for the report.
    async fn shelve(&self, job_id: &JobId, artifact: Artifact) -> ArtifactRef {
        let mut reference = ArtifactRef {
            sha256: artifact.sha256.clone(),
            size_bytes: artifact.size_bytes,
            url: None,
        };
        let evicted = if self.config.max_artifacts == 0 {
            vec![artifact]
        } else {
            reference.url = self.config.artifact_url(job_id);
            self.state
                .lock()
                .await
                .artifacts
                .put(job_id.clone(), artifact, self.config.max_artifacts)
        };
        for old in evicted {
            if let Err(e) = tokio::fs::remove_file(&old.path).await {
                tracing::debug!(path = %old.path.display(), error = %e, "evicted artifact not removed");
            }
        }
        reference
    }

    async fn supervise(
        &self,
        offer: &JobOffer,
        spec: &SandboxSpec,
        handle: &SandboxHandle,
        mut cancel: watch::Receiver<bool>,
    ) -> Execution {
        if let Err(e) = self.backend.start(handle).await {
            return Execution::failed(ErrorClass::SandboxError, e.to_string(), ResourceUsage::default());
        }
        let started = Instant::now();
        let budget = Duration::from_secs(offer.time_budget_secs);
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        let wait = self.backend.wait(handle);
        tokio::pin!(wait);

        let mut ping = tokio::time::interval(self.config.progress_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor = tokio::time::interval(self.config.monitor_interval());
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut peak = ResourceUsage::default();
        let mut side_effects = false;
        let mut vram_unmonitored = false;

        loop {
            tokio::select! {
                exit = &mut wait => {
                    return match exit {
                        Ok(exit) => self.classify(exit, peak),
                        Err(e) => Execution::failed(ErrorClass::SandboxError, e.to_string(), peak),
                    };
                }
                _ = &mut deadline => {
                    self.kill(handle, "time budget exhausted").await;
                    return Execution::ended(
                        Outcome::TimedOut,
                        format!("time budget of {}s exhausted", budget.as_secs()),
                        peak,
                    );
                }
                _ = cancel.changed() => {
                    self.kill(handle, "cancelled by requester").await;
                    return Execution::ended(Outcome::Cancelled, "cancelled by requester", peak);
                }
                _ = monitor.tick() => match self.backend.status(handle).await {
                    Ok(status) => {
                        peak = peak.max(status.usage);
                        side_effects |= status.side_effects;
                        if spec.gpus && !status.vram_monitored && !vram_unmonitored {
                            vram_unmonitored = true;
                            tracing::warn!(
                                sandbox = %handle.id,
                                "GPU memory of this sandbox cannot be sampled; VRAM ceiling not enforced"
                            );
                        }
                        if let Some(violation) = spec.limits.violation(&status.usage) {
                            self.kill(handle, &violation).await;
                            return Execution::failed(ErrorClass::ResourceViolation, violation, peak);
                        }
                    }
                    Err(e) => tracing::debug!(sandbox = %handle.id, error = %e, "usage sample failed"),
                },
                _ = ping.tick() => self.send_progress(offer, started.elapsed(), budget, side_effects),
            }
        }
    }

    fn classify(&self, exit: SandboxExit, peak: ResourceUsage) -> Execution {
        let artifact = exit.artifact;
        let logs = ExecutionLogs {
            stdout: truncate_log(&exit.stdout, self.config.max_log_bytes),
            stderr: truncate_log(&exit.stderr, self.config.max_log_bytes),
        };
        let mut execution = if exit.oom_killed {
            Execution::failed(
                ErrorClass::ResourceViolation,
                "killed by the runtime for exceeding its memory limit",
                peak,
            )
        } else if exit.exit_code == 0 {
            Execution {
                outcome: Outcome::Succeeded,
                detail: None,
                output_ref: Some(
                    artifact
                        .as_ref()
                        .map(Artifact::output_ref)
                        .unwrap_or_else(|| output_digest(&logs)),
                ),
                consumed: peak,
                logs: None,
                artifact: None,
            }
        } else {
            let tail = tail_lines(&logs.stderr, 20);
            Execution::failed(
                ErrorClass::PayloadError,
                format!("exit code {}: {}", exit.exit_code, tail),
                peak,
            )
        };
        execution.logs = Some(logs);
        execution.artifact = artifact;
        execution
    }

    async fn kill(&self, handle: &SandboxHandle, reason: &str) {
        METRICS.inc_sandboxes_killed();
        obs::emit_sandbox_killed(&handle.job_id, reason);
        if let Err(e) = self.backend.kill(handle).await {
            tracing::warn!(sandbox = %handle.id, error = %e, "kill failed; teardown will follow");
        }
    }

    fn send_progress(&self, offer: &JobOffer, elapsed: Duration, budget: Duration, side_effects: bool) {
        let percent = if budget.is_zero() {
            None
        } else {
            Some((elapsed.as_secs_f32() / budget.as_secs_f32() * 100.0).min(99.0))
        };
        let ping = WireMessage::Progress(ProgressPing {
            job_id: offer.job_id.clone(),
            at: Utc::now(),
            percent,
            phase: Some("running".into()),
            side_effects,
        });
        let messenger = self.messenger.clone();
        let to = offer.reply_to.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger.send(&to, &ping).await {
                tracing::debug!(to = %to, error = %e, "progress ping not delivered");
            }
        });
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub fn truncate_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]\n", &s[..end])
}

fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn output_digest(logs: &ExecutionLogs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logs.stdout.as_bytes());
    hasher.update([0u8]);
    hasher.update(logs.stderr.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
