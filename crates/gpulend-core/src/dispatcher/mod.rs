//! Job Dispatcher.
//!
//! Owns every session this node submitted. `submit` runs the first match
//! synchronously so `NoCandidate` reaches the caller at once; after that a
//! per-session driver task walks the state machine
//!
//! ```text
//! Created → Offered → Accepted → Running → Succeeded | Failed | TimedOut
//!             ↺ (decline)              ↘ PeerLost → Offered (once)
//! ```
//!
//! Inbound progress and terminal reports are routed to the driver through
//! the session's inbox. Each session writes exactly one ledger entry when it
//! ends.

mod driver;
mod error;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use gpulend_ledger::{JobId, Ledger, LedgerEntry, PeerId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::DispatchConfig;
use crate::domain::{JobOutcome, JobRequest, JobSession, JobState, SessionEvent};
use crate::matcher::Matcher;
use crate::metrics::METRICS;
use crate::obs::{self, JobRole};
use crate::registry::RegistryHandle;
use crate::transport::Messenger;
use crate::wire::{PeerAddress, ProgressPing, TerminalReport};

use driver::Driver;
pub use error::{DispatchError, DispatchResult};

const EVENT_BUFFER: usize = 256;

/// Messages delivered to a session's driver.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    Progress { from: PeerId, ping: ProgressPing },
    Terminal { from: PeerId, report: TerminalReport },
    Cancel,
}

struct SessionSlot {
    session: JobSession,
    inbox: mpsc::UnboundedSender<DriverEvent>,
    done: watch::Receiver<Option<JobOutcome>>,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    local: PeerId,
    address: PeerAddress,
    config: DispatchConfig,
    matcher: Matcher,
    registry: RegistryHandle,
    messenger: Messenger,
    ledger: Arc<dyn Ledger>,
    sessions: Mutex<HashMap<JobId, SessionSlot>>,
    events: broadcast::Sender<SessionEvent>,
    stopping: AtomicBool,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        address: PeerAddress,
        config: DispatchConfig,
        registry: RegistryHandle,
        messenger: Messenger,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                local: messenger.peer_id().clone(),
                address,
                config,
                matcher: Matcher::new(registry.clone()),
                registry,
                messenger,
                ledger,
                sessions: Mutex::new(HashMap::new()),
                events,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.inner.local
    }

    /// Validate, match, and start driving a new session.
    pub async fn submit(&self, request: JobRequest) -> DispatchResult<JobId> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(DispatchError::Stopped);
        }
        if request.time_budget_secs == 0 {
            return Err(DispatchError::InvalidRequest(
                "time budget must be at least one second".into(),
            ));
        }
        if request.requester != self.inner.local {
            return Err(DispatchError::InvalidRequest(
                "requester must be the submitting peer".into(),
            ));
        }
        let first = self.inner.matcher.match_job(&request, &HashSet::new())?;

        let job_id = JobId::new();
        METRICS.inc_jobs_submitted();
        obs::emit_job_submitted(&job_id, &request.requester, &first.peer_id);

        let (inbox, events) = mpsc::unbounded_channel();
        let (done_tx, done) = watch::channel(None);
        let session = JobSession::new(job_id.clone(), request.clone());
        let created = SessionEvent {
            job_id: job_id.clone(),
            state: JobState::Created,
            peer: None,
            at: Utc::now(),
        };

        let mut sessions = self.inner.lock();
        sessions.insert(
            job_id.clone(),
            SessionSlot {
                session,
                inbox,
                done,
                task: None,
            },
        );
        let _ = self.inner.events.send(created);

        let driver = Driver::new(Arc::clone(&self.inner), job_id.clone(), request, events, done_tx);
        let span = obs::job_span(&job_id, JobRole::Requester);
        let task = tokio::spawn(driver.run(first).instrument(span));
        if let Some(slot) = sessions.get_mut(&job_id) {
            slot.task = Some(task);
        }
        Ok(job_id)
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobSession> {
        self.inner.lock().get(job_id).map(|s| s.session.clone())
    }

    /// Every session, oldest first.
    pub fn sessions(&self) -> Vec<JobSession> {
        let mut all: Vec<JobSession> = self
            .inner
            .lock()
            .values()
            .map(|s| s.session.clone())
            .collect();
        all.sort_by(|a, b| {
            a.request
                .submitted_at
                .cmp(&b.request.submitted_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        all
    }

    /// Resolve once the session reaches a terminal state.
    pub async fn wait(&self, job_id: &JobId) -> DispatchResult<JobOutcome> {
        let mut done = self
            .inner
            .lock()
            .get(job_id)
            .map(|s| s.done.clone())
            .ok_or_else(|| DispatchError::UnknownJob(job_id.clone()))?;
        let outcome = done
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| DispatchError::Stopped)?
            .clone();
        outcome.ok_or(DispatchError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Request cancellation. Returns false when the session already ended.
    pub fn cancel(&self, job_id: &JobId) -> DispatchResult<bool> {
        let sessions = self.inner.lock();
        let slot = sessions
            .get(job_id)
            .ok_or_else(|| DispatchError::UnknownJob(job_id.clone()))?;
        if slot.session.is_finished() {
            return Ok(false);
        }
        Ok(slot.inbox.send(DriverEvent::Cancel).is_ok())
    }

    /// Route a progress ping. Only the currently assigned peer is heard.
    pub fn handle_progress(&self, from: &PeerId, ping: ProgressPing) -> bool {
        let job_id = ping.job_id.clone();
        self.route(&job_id, from, DriverEvent::Progress {
            from: from.clone(),
            ping,
        })
    }

    /// Route a terminal report. Only the currently assigned peer is heard.
    pub fn handle_terminal(&self, from: &PeerId, report: TerminalReport) -> bool {
        let job_id = report.job_id.clone();
        self.route(&job_id, from, DriverEvent::Terminal {
            from: from.clone(),
            report,
        })
    }

    fn route(&self, job_id: &JobId, from: &PeerId, event: DriverEvent) -> bool {
        let sessions = self.inner.lock();
        match sessions.get(job_id) {
            Some(slot)
                if !slot.session.is_finished() && slot.session.assigned.as_ref() == Some(from) =>
            {
                slot.inbox.send(event).is_ok()
            }
            _ => {
                tracing::debug!(job_id = %job_id, from = %from.short(), "report from unassigned peer ignored");
                false
            }
        }
    }

    /// Cancel every live session and wait (bounded) for their drivers.
    pub async fn shutdown(&self, wait: Duration) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = {
            let mut sessions = self.inner.lock();
            sessions
                .values_mut()
                .filter(|s| !s.session.is_finished())
                .filter_map(|s| {
                    let _ = s.inbox.send(DriverEvent::Cancel);
                    s.task.take()
                })
                .collect()
        };
        if tokio::time::timeout(wait, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("sessions still open at dispatcher shutdown");
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance a session and publish the transition. Returns false when the
    /// move is not allowed from the current state.
    fn transition(&self, job_id: &JobId, state: JobState, peer: Option<&PeerId>) -> bool {
        let event = {
            let mut sessions = self.lock();
            let Some(slot) = sessions.get_mut(job_id) else {
                return false;
            };
            match slot.session.advance(state, peer) {
                Ok(()) => SessionEvent {
                    job_id: job_id.clone(),
                    state,
                    peer: slot.session.assigned.clone(),
                    at: Utc::now(),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "session transition refused");
                    return false;
                }
            }
        };
        obs::emit_job_transition(job_id, state.as_str(), event.peer.as_ref());
        let _ = self.events.send(event);
        true
    }

    /// Close the session: terminal state, one ledger entry, trust refresh,
    /// then wake waiters.
    async fn finish(
        &self,
        job_id: &JobId,
        outcome: JobOutcome,
        done: &watch::Sender<Option<JobOutcome>>,
    ) {
        let event = {
            let mut sessions = self.lock();
            sessions.get_mut(job_id).and_then(|slot| {
                match slot.session.finish(outcome.clone()) {
                    Ok(()) => Some(SessionEvent {
                        job_id: job_id.clone(),
                        state: slot.session.state,
                        peer: slot.session.assigned.clone(),
                        at: Utc::now(),
                    }),
                    Err(e) => {
                        tracing::error!(error = %e, "could not close session");
                        None
                    }
                }
            })
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }

        let entry = LedgerEntry {
            job_id: job_id.clone(),
            requester: self.local.clone(),
            executor: outcome.executor.clone(),
            outcome: outcome.outcome,
            reason: outcome.reason.clone(),
            output_ref: outcome.output_ref.clone(),
            consumed: outcome.consumed,
            duration_ms: outcome.duration_ms,
            recorded_at: Utc::now(),
        };
        match self.ledger.record(entry).await {
            Ok(()) => METRICS.inc_ledger_entries(),
            Err(e) => obs::emit_ledger_write_failed(job_id, &e),
        }
        obs::emit_job_finished(job_id, &outcome.executor, &outcome.outcome, outcome.duration_ms);
        self.refresh_trust(&outcome.executor).await;
        done.send_replace(Some(outcome));
    }

    async fn refresh_trust(&self, peer: &PeerId) {
        let score = self.ledger.trust_score(peer).await;
        let failures = self.ledger.recent_failures(peer).await;
        match (score, failures) {
            (Ok(score), Ok(failures)) => {
                if let Err(e) = self.registry.set_trust(peer, score, failures).await {
                    tracing::debug!(error = %e, "trust not refreshed");
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(peer = %peer.short(), error = %e, "could not compute trust score");
            }
        }
    }
}
