//! Per-session driver task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gpulend_ledger::{ErrorClass, JobId, Outcome, PeerId, ResourceUsage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{DriverEvent, Inner};
use crate::domain::{JobOutcome, JobRequest, JobState};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::PeerRecord;
use crate::transport::{Messenger, RetryPolicy};
use crate::wire::{JobOffer, PeerAddress, TerminalReport, WireMessage, WireReply};

const START_RETRY: RetryPolicy = RetryPolicy {
    attempts: 2,
    backoff_base: Duration::from_millis(100),
};

enum Placement {
    Placed(PeerRecord),
    /// Every candidate declined; attributed to the last one.
    Declined { peer: PeerId, reason: String },
    NoCandidate,
    Cancelled,
}

enum Attempt {
    Finished(JobOutcome),
    Lost { side_effects: bool },
}

pub(super) struct Driver {
    inner: Arc<Inner>,
    job_id: JobId,
    request: JobRequest,
    inbox: mpsc::UnboundedReceiver<DriverEvent>,
    done: watch::Sender<Option<JobOutcome>>,
    started: Instant,
    exclude: HashSet<PeerId>,
    cancel_requested: bool,
}

impl Driver {
    pub(super) fn new(
        inner: Arc<Inner>,
        job_id: JobId,
        request: JobRequest,
        inbox: mpsc::UnboundedReceiver<DriverEvent>,
        done: watch::Sender<Option<JobOutcome>>,
    ) -> Self {
        Self {
            inner,
            job_id,
            request,
            inbox,
            done,
            started: Instant::now(),
            exclude: HashSet::new(),
            cancel_requested: false,
        }
    }

    pub(super) async fn run(mut self, first: PeerRecord) {
        let mut next = Some(first);
        let mut lost: Option<PeerId> = None;
        let mut redispatches = 0;

        let outcome = loop {
            let peer = match self.place(next.take()).await {
                Placement::Placed(peer) => peer,
                Placement::Declined { peer, reason } => {
                    break self.ended(Outcome::Declined, &peer, reason);
                }
                Placement::NoCandidate => {
                    let peer = lost.clone().unwrap_or_else(|| self.inner.local.clone());
                    break self.ended(Outcome::PeerLost, &peer, "no other peer available for re-dispatch");
                }
                Placement::Cancelled => {
                    let peer = lost.clone().unwrap_or_else(|| self.inner.local.clone());
                    break self.ended(Outcome::Cancelled, &peer, "cancelled by submitter");
                }
            };

            match self.attend(&peer).await {
                Attempt::Finished(outcome) => break outcome,
                Attempt::Lost { side_effects } => {
                    METRICS.inc_peers_lost();
                    let retry = !side_effects && redispatches < self.inner.config.max_peer_lost_redispatch;
                    obs::emit_peer_lost(&self.job_id, &peer.peer_id, retry);
                    if let Some(addr) = peer.address() {
                        self.cancel_remote_detached(addr.clone());
                    }
                    if !retry {
                        let reason = if side_effects {
                            "executor went silent after reporting side effects"
                        } else {
                            "executor went silent"
                        };
                        break self.ended(Outcome::PeerLost, &peer.peer_id, reason);
                    }
                    redispatches += 1;
                    self.exclude.insert(peer.peer_id.clone());
                    lost = Some(peer.peer_id);
                }
            }
        };

        self.inner.finish(&self.job_id, outcome, &self.done).await;
    }

    /// Offer the job until a peer accepts, the decline budget runs out, or
    /// no candidate is left. `first` is used before re-matching.
    async fn place(&mut self, first: Option<PeerRecord>) -> Placement {
        let mut candidate = first;
        let mut declines = 0u32;
        let mut last_decline: Option<(PeerId, String)> = None;

        loop {
            if self.cancel_pending() {
                return Placement::Cancelled;
            }
            let peer = match candidate.take() {
                Some(peer) => peer,
                None => match self.inner.matcher.match_job(&self.request, &self.exclude) {
                    Ok(peer) => peer,
                    Err(_) => {
                        return match last_decline {
                            Some((peer, reason)) => Placement::Declined { peer, reason },
                            None => Placement::NoCandidate,
                        }
                    }
                },
            };

            self.inner
                .transition(&self.job_id, JobState::Offered, Some(&peer.peer_id));
            match self.offer(&peer).await {
                Ok(()) => {
                    self.inner.transition(&self.job_id, JobState::Accepted, None);
                    return Placement::Placed(peer);
                }
                Err(reason) => {
                    METRICS.inc_offers_declined();
                    obs::emit_offer_declined(&self.job_id, &peer.peer_id, &reason);
                    self.exclude.insert(peer.peer_id.clone());
                    declines += 1;
                    last_decline = Some((peer.peer_id, reason));
                    if declines > self.inner.config.max_decline_retries {
                        if let Some((peer, reason)) = last_decline {
                            return Placement::Declined { peer, reason };
                        }
                        return Placement::NoCandidate;
                    }
                }
            }
        }
    }

    /// One offer round trip. Transport failures and timeouts count as a
    /// decline with the error as reason.
    async fn offer(&self, peer: &PeerRecord) -> Result<(), String> {
        let Some(addr) = peer.address() else {
            return Err("peer advertised no address".into());
        };
        let offer = WireMessage::Offer(JobOffer {
            job_id: self.job_id.clone(),
            requester: self.inner.local.clone(),
            reply_to: self.inner.address.clone(),
            requirement: self.request.requirement.clone(),
            payload: self.request.payload.clone(),
            time_budget_secs: self.request.time_budget_secs,
        });
        let timeout = self.inner.config.offer_timeout();
        let sent = Instant::now();
        let reply = match tokio::time::timeout(timeout, self.inner.messenger.send(addr, &offer)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("no answer within {}ms", timeout.as_millis())),
        };
        if let Err(e) = self
            .inner
            .registry
            .observe_latency(&peer.peer_id, sent.elapsed())
            .await
        {
            tracing::debug!(error = %e, "latency not recorded");
        }
        match reply {
            WireReply::Offer(resp) if resp.job_id == self.job_id && resp.is_accept() => Ok(()),
            WireReply::Offer(resp) => Err(resp.reason.unwrap_or_else(|| "declined".into())),
            WireReply::Rejected { reason } => Err(reason),
            WireReply::Ack => Err("unexpected reply to offer".into()),
        }
    }

    /// Start the accepted job and follow it to an end or a loss.
    async fn attend(&mut self, peer: &PeerRecord) -> Attempt {
        let Some(addr) = peer.address().cloned() else {
            self.inner.transition(&self.job_id, JobState::PeerLost, None);
            return Attempt::Lost { side_effects: false };
        };
        let start = WireMessage::Start {
            job_id: self.job_id.clone(),
        };
        match self.inner.messenger.send_with_retry(&addr, &start, START_RETRY).await {
            Ok(WireReply::Ack) => {}
            Ok(other) => {
                tracing::warn!(peer = %peer.peer_id.short(), reply = ?other, "start refused");
                self.inner.transition(&self.job_id, JobState::PeerLost, None);
                return Attempt::Lost { side_effects: false };
            }
            Err(e) => {
                tracing::warn!(peer = %peer.peer_id.short(), error = %e, "start not delivered");
                self.inner.transition(&self.job_id, JobState::PeerLost, None);
                return Attempt::Lost { side_effects: false };
            }
        }

        let config = &self.inner.config;
        let watchdog_after = self.request.time_budget() + config.watchdog_grace();
        let progress_timeout = config.progress_timeout();
        let watchdog = tokio::time::sleep(watchdog_after);
        tokio::pin!(watchdog);
        let liveness = tokio::time::sleep(progress_timeout);
        tokio::pin!(liveness);
        let mut side_effects = false;
        let mut running = false;

        loop {
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(DriverEvent::Progress { from, ping }) if from == peer.peer_id && ping.job_id == self.job_id => {
                        side_effects |= ping.side_effects;
                        liveness.as_mut().reset(Instant::now() + progress_timeout);
                        if !running {
                            running = self.inner.transition(&self.job_id, JobState::Running, None);
                        }
                    }
                    Some(DriverEvent::Terminal { from, report }) if from == peer.peer_id && report.job_id == self.job_id => {
                        return Attempt::Finished(self.from_report(&peer.peer_id, report));
                    }
                    Some(DriverEvent::Cancel) => {
                        self.cancel_remote(&addr).await;
                        return Attempt::Finished(self.ended(Outcome::Cancelled, &peer.peer_id, "cancelled by submitter"));
                    }
                    Some(_) => tracing::debug!("stale report dropped"),
                    None => {
                        return Attempt::Finished(self.ended(Outcome::Cancelled, &peer.peer_id, "dispatcher stopped"));
                    }
                },
                _ = &mut watchdog => {
                    self.cancel_remote(&addr).await;
                    return Attempt::Finished(self.ended(
                        Outcome::TimedOut,
                        &peer.peer_id,
                        format!("watchdog fired after {}s", watchdog_after.as_secs()),
                    ));
                }
                _ = &mut liveness => {
                    self.inner.transition(&self.job_id, JobState::PeerLost, None);
                    return Attempt::Lost { side_effects };
                }
            }
        }
    }

    /// Drain queued events; remember whether a cancel arrived.
    fn cancel_pending(&mut self) -> bool {
        while let Ok(event) = self.inbox.try_recv() {
            if matches!(event, DriverEvent::Cancel) {
                self.cancel_requested = true;
            }
        }
        self.cancel_requested
    }

    async fn cancel_remote(&self, addr: &PeerAddress) {
        let cancel = WireMessage::Cancel {
            job_id: self.job_id.clone(),
        };
        if let Err(e) = self.inner.messenger.send(addr, &cancel).await {
            tracing::debug!(to = %addr, error = %e, "cancel not delivered");
        }
    }

    /// Tell a lost peer to stop, without waiting for it.
    fn cancel_remote_detached(&self, addr: PeerAddress) {
        spawn_lost_cancel(self.inner.messenger.clone(), addr, self.job_id.clone());
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn ended(&self, outcome: Outcome, executor: &PeerId, reason: impl Into<String>) -> JobOutcome {
        JobOutcome {
            outcome,
            executor: executor.clone(),
            reason: Some(reason.into()),
            output_ref: None,
            consumed: ResourceUsage::default(),
            duration_ms: self.elapsed_ms(),
            logs: None,
            artifact: None,
        }
    }

    fn from_report(&self, executor: &PeerId, report: TerminalReport) -> JobOutcome {
        let (outcome, reason) = reported_outcome(report.outcome, report.detail);
        if outcome != report.outcome {
            tracing::warn!(
                job_id = %self.job_id,
                executor = %executor.short(),
                reported = report.outcome.label(),
                "executor reported an outcome it cannot produce"
            );
        }
        JobOutcome {
            outcome,
            executor: executor.clone(),
            reason,
            output_ref: report.output_ref,
            consumed: report.consumed,
            duration_ms: self.elapsed_ms(),
            logs: report.logs,
            artifact: report.artifact,
        }
    }
}

fn spawn_lost_cancel(messenger: Messenger, addr: PeerAddress, job_id: JobId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = WireMessage::Cancel { job_id };
        if let Err(e) = messenger.send(&addr, &cancel).await {
            tracing::debug!(to = %addr, error = %e, "cancel to lost peer not delivered");
        }
    })
}

/// Outcomes only the requester side can decide are not accepted from an
/// executor; they close the session as an internal failure.
fn reported_outcome(outcome: Outcome, detail: Option<String>) -> (Outcome, Option<String>) {
    if JobState::Running.can_advance_to(JobState::from_outcome(&outcome)) {
        return (outcome, detail);
    }
    let reason = match detail {
        Some(d) => format!("executor reported {}: {d}", outcome.label()),
        None => format!("executor reported {}", outcome.label()),
    };
    (
        Outcome::Failed {
            class: ErrorClass::InternalError,
        },
        Some(reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;
    use crate::transport::LocalNetwork;

    /// Log sink for a scoped subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn undeliverable_lost_peer_cancel_is_logged() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let net = LocalNetwork::new();
        let messenger = Messenger::new(
            Arc::new(PeerIdentity::from_seed([3u8; 32])),
            net.transport("local://requester".into()),
            Duration::from_secs(1),
        );
        spawn_lost_cancel(messenger, "local://gone".into(), JobId::from("job-1"))
            .await
            .unwrap();
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("cancel to lost peer not delivered"), "{text}");
        assert!(text.contains("local://gone"), "{text}");
    }

    #[test]
    fn executor_cannot_report_requester_outcomes() {
        for bogus in [Outcome::Declined, Outcome::PeerLost] {
            let (outcome, reason) = reported_outcome(bogus, Some("nope".into()));
            assert_eq!(
                outcome,
                Outcome::Failed {
                    class: ErrorClass::InternalError
                }
            );
            assert!(reason.unwrap().contains("nope"));
        }
    }

    #[test]
    fn legal_outcomes_pass_through() {
        for legal in [Outcome::Succeeded, Outcome::TimedOut, Outcome::Cancelled] {
            assert_eq!(reported_outcome(legal, None), (legal, None));
        }
    }
}
