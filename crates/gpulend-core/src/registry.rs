//! Peer Registry.
//!
//! The map of known peers is owned by a single actor task. Mutations arrive
//! as commands over an mpsc channel; after applying one, the actor publishes
//! a fresh immutable [`RegistrySnapshot`] through a `watch` channel and only
//! then acknowledges the caller. Readers (the matcher, the reporter, the
//! control API) borrow the latest snapshot and never observe a partial
//! update.
//!
//! Liveness is judged against `tokio::time::Instant`, so a peer silent for
//! longer than the liveness timeout drops out of [`RegistrySnapshot::list`]
//! at read time, whether or not a sweep has run yet.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gpulend_ledger::trust::TRUST_PRIOR;
use gpulend_ledger::PeerId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RegistryConfig;
use crate::domain::api::PeerView;
use crate::domain::{Capability, ResourceRequirement};
use crate::metrics::METRICS;
use crate::obs;
use crate::wire::{CapabilityReport, PeerAddress};

/// Weight of a new round-trip sample in the latency average.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("peer registry is not running")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<PeerAddress>,
    pub capability: Capability,
    pub last_seen: Instant,
    /// Cleared by a sweep or a late heartbeat; set again only by a report.
    pub reachable: bool,
    pub trust_score: f64,
    pub recent_failures: u32,
    pub latency_ms: Option<f64>,
}

impl PeerRecord {
    pub fn address(&self) -> Option<&PeerAddress> {
        self.addresses.first()
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn view(&self, now: Instant) -> PeerView {
        PeerView {
            peer_id: self.peer_id.clone(),
            addresses: self.addresses.iter().map(|a| a.to_string()).collect(),
            capability: self.capability.clone(),
            reachable: self.reachable,
            silent_ms: self.silent_for(now).as_millis() as u64,
            trust_score: self.trust_score,
            recent_failures: self.recent_failures,
            latency_ms: self.latency_ms,
        }
    }
}

/// Registry listing order: trust descending, free VRAM descending, lowest
/// latency (unknown last), then peer id.
fn list_order(a: &PeerRecord, b: &PeerRecord) -> Ordering {
    b.trust_score
        .total_cmp(&a.trust_score)
        .then_with(|| b.capability.vram_free_mb.cmp(&a.capability.vram_free_mb))
        .then_with(|| {
            let la = a.latency_ms.unwrap_or(f64::INFINITY);
            let lb = b.latency_ms.unwrap_or(f64::INFINITY);
            la.total_cmp(&lb)
        })
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    peers: BTreeMap<PeerId, PeerRecord>,
    liveness_timeout: Duration,
}

impl RegistrySnapshot {
    fn empty(liveness_timeout: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            liveness_timeout,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn is_live(&self, record: &PeerRecord, now: Instant) -> bool {
        record.reachable && record.silent_for(now) <= self.liveness_timeout
    }

    /// Live peers meeting `floor`, in listing order.
    pub fn list(&self, floor: &ResourceRequirement) -> Vec<PeerRecord> {
        let now = Instant::now();
        let mut out: Vec<PeerRecord> = self
            .peers
            .values()
            .filter(|r| self.is_live(r, now) && r.capability.satisfies(floor))
            .cloned()
            .collect();
        out.sort_by(list_order);
        out
    }

    /// Addresses of every known peer other than `me`.
    pub fn addresses_except(&self, me: &PeerId) -> Vec<PeerAddress> {
        self.peers
            .values()
            .filter(|r| &r.peer_id != me)
            .filter_map(|r| r.address().cloned())
            .collect()
    }

    pub fn views(&self) -> Vec<PeerView> {
        let now = Instant::now();
        let mut records: Vec<&PeerRecord> = self.peers.values().collect();
        records.sort_by(|a, b| list_order(a, b));
        records.into_iter().map(|r| r.view(now)).collect()
    }
}

/// Result of ingesting a capability report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Inserted,
    Updated,
    /// Not newer than the capability already held; ignored.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub marked_unreachable: usize,
    pub purged: usize,
}

enum Command {
    Report {
        report: CapabilityReport,
        ack: oneshot::Sender<ReportOutcome>,
    },
    Heartbeat {
        peer: PeerId,
        ack: oneshot::Sender<bool>,
    },
    ObserveLatency {
        peer: PeerId,
        rtt: Duration,
        ack: oneshot::Sender<()>,
    },
    SetTrust {
        peer: PeerId,
        score: f64,
        recent_failures: u32,
        ack: oneshot::Sender<()>,
    },
    Remove {
        peer: PeerId,
        ack: oneshot::Sender<bool>,
    },
    Sweep {
        ack: oneshot::Sender<SweepStats>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<RegistrySnapshot>>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(make(ack))
            .await
            .map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)
    }

    /// Upsert the reporting peer and reset its liveness timer.
    pub async fn report(&self, report: CapabilityReport) -> Result<ReportOutcome, RegistryError> {
        self.request(|ack| Command::Report { report, ack }).await
    }

    /// Refresh liveness without touching capability. Returns false when the
    /// peer is unknown or already past its liveness timeout; such a peer
    /// must send a full report.
    pub async fn heartbeat(&self, peer: &PeerId) -> Result<bool, RegistryError> {
        let peer = peer.clone();
        self.request(|ack| Command::Heartbeat { peer, ack }).await
    }

    pub async fn observe_latency(&self, peer: &PeerId, rtt: Duration) -> Result<(), RegistryError> {
        let peer = peer.clone();
        self.request(|ack| Command::ObserveLatency { peer, rtt, ack })
            .await
    }

    pub async fn set_trust(
        &self,
        peer: &PeerId,
        score: f64,
        recent_failures: u32,
    ) -> Result<(), RegistryError> {
        let peer = peer.clone();
        self.request(|ack| Command::SetTrust {
            peer,
            score,
            recent_failures,
            ack,
        })
        .await
    }

    pub async fn remove(&self, peer: &PeerId) -> Result<bool, RegistryError> {
        let peer = peer.clone();
        self.request(|ack| Command::Remove { peer, ack }).await
    }

    pub async fn sweep(&self) -> Result<SweepStats, RegistryError> {
        self.request(|ack| Command::Sweep { ack }).await
    }

    /// Stop the actor. Later mutations fail with [`RegistryError::Stopped`];
    /// the last snapshot stays readable.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.request(|ack| Command::Shutdown { ack }).await
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn list(&self, floor: &ResourceRequirement) -> Vec<PeerRecord> {
        self.snapshot().list(floor)
    }
}

/// Registry actor state.
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
    liveness_timeout: Duration,
    archival_timeout: Duration,
    publish: watch::Sender<Arc<RegistrySnapshot>>,
}

impl PeerRegistry {
    /// Start the actor. The sweep runs once per heartbeat interval.
    pub fn spawn(config: &RegistryConfig) -> (RegistryHandle, JoinHandle<()>) {
        let liveness_timeout = config.liveness_timeout();
        let (publish, snapshot) = watch::channel(Arc::new(RegistrySnapshot::empty(liveness_timeout)));
        let (tx, rx) = mpsc::channel(256);
        let actor = PeerRegistry {
            peers: BTreeMap::new(),
            liveness_timeout,
            archival_timeout: config.archival_timeout(),
            publish,
        };
        let task = tokio::spawn(actor.run(rx, config.heartbeat_interval()));
        (RegistryHandle { tx, snapshot }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.apply(cmd) {
                            tracing::debug!(peers = self.peers.len(), "peer registry stopped");
                            break;
                        }
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    let stats = self.sweep(Instant::now());
                    if stats != SweepStats::default() {
                        self.publish();
                    }
                }
            }
        }
    }

    fn publish(&self) {
        self.publish.send_replace(Arc::new(RegistrySnapshot {
            peers: self.peers.clone(),
            liveness_timeout: self.liveness_timeout,
        }));
    }

    /// Apply one command. Returns false once the actor should stop.
    fn apply(&mut self, cmd: Command) -> bool {
        let now = Instant::now();
        match cmd {
            Command::Report { report, ack } => {
                let outcome = self.ingest_report(report, now);
                if outcome != ReportOutcome::Stale {
                    self.publish();
                }
                let _ = ack.send(outcome);
            }
            Command::Heartbeat { peer, ack } => {
                let alive = self.ingest_heartbeat(&peer, now);
                self.publish();
                let _ = ack.send(alive);
            }
            Command::ObserveLatency { peer, rtt, ack } => {
                if let Some(r) = self.peers.get_mut(&peer) {
                    let sample = rtt.as_secs_f64() * 1000.0;
                    r.latency_ms = Some(match r.latency_ms {
                        Some(prev) => prev * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA,
                        None => sample,
                    });
                    self.publish();
                }
                let _ = ack.send(());
            }
            Command::SetTrust {
                peer,
                score,
                recent_failures,
                ack,
            } => {
                if let Some(r) = self.peers.get_mut(&peer) {
                    r.trust_score = score.clamp(0.0, 1.0);
                    r.recent_failures = recent_failures;
                    self.publish();
                }
                let _ = ack.send(());
            }
            Command::Remove { peer, ack } => {
                let removed = self.peers.remove(&peer).is_some();
                if removed {
                    self.publish();
                }
                let _ = ack.send(removed);
            }
            Command::Sweep { ack } => {
                let stats = self.sweep(now);
                self.publish();
                let _ = ack.send(stats);
            }
            Command::Shutdown { ack } => {
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn ingest_report(&mut self, report: CapabilityReport, now: Instant) -> ReportOutcome {
        let CapabilityReport {
            peer_id,
            addresses,
            capability,
        } = report;
        match self.peers.get_mut(&peer_id) {
            Some(existing) => {
                if capability.reported_at <= existing.capability.reported_at {
                    tracing::debug!(peer = %peer_id.short(), "ignoring reordered or repeated capability report");
                    return ReportOutcome::Stale;
                }
                if !addresses.is_empty() {
                    existing.addresses = addresses;
                }
                existing.capability = capability;
                existing.last_seen = now;
                existing.reachable = true;
                ReportOutcome::Updated
            }
            None => {
                tracing::info!(
                    peer = %peer_id.short(),
                    gpu = %capability.gpu_model,
                    vram_free_mb = capability.vram_free_mb,
                    "peer discovered"
                );
                self.peers.insert(
                    peer_id.clone(),
                    PeerRecord {
                        peer_id,
                        addresses,
                        capability,
                        last_seen: now,
                        reachable: true,
                        trust_score: TRUST_PRIOR,
                        recent_failures: 0,
                        latency_ms: None,
                    },
                );
                ReportOutcome::Inserted
            }
        }
    }

    fn ingest_heartbeat(&mut self, peer: &PeerId, now: Instant) -> bool {
        let Some(record) = self.peers.get_mut(peer) else {
            return false;
        };
        if !record.reachable || record.silent_for(now) > self.liveness_timeout {
            record.reachable = false;
            return false;
        }
        record.last_seen = now;
        true
    }

    fn sweep(&mut self, now: Instant) -> SweepStats {
        let mut stats = SweepStats::default();
        let archival = self.archival_timeout;
        let liveness = self.liveness_timeout;
        self.peers.retain(|_, r| {
            let silent = r.silent_for(now);
            if silent > archival {
                stats.purged += 1;
                return false;
            }
            if r.reachable && silent > liveness {
                r.reachable = false;
                stats.marked_unreachable += 1;
                obs::emit_peer_evicted(&r.peer_id, silent.as_millis() as u64);
            }
            true
        });
        if stats.marked_unreachable > 0 {
            METRICS.add_peers_evicted(stats.marked_unreachable as u64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval_ms: 1_000,
            liveness_timeout_ms: None,
            archival_timeout_ms: 10_000,
            full_report_every: 12,
        }
    }

    fn report(peer: &str, vram_free: u64) -> CapabilityReport {
        CapabilityReport {
            peer_id: PeerId::from(peer),
            addresses: vec![PeerAddress(format!("local://{peer}"))],
            capability: Capability {
                gpu_model: "gpu".into(),
                vram_total_mb: 24_000,
                vram_free_mb: vram_free,
                compute_units: 80,
                cpu_cores: 8,
                memory_total_mb: 32_000,
                memory_free_mb: 16_000,
                sandbox_available: true,
                max_concurrent_jobs: 1,
                active_jobs: 0,
                reported_at: Utc::now(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn report_is_visible_once_acked() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        assert_eq!(reg.report(report("a", 8_000)).await.unwrap(), ReportOutcome::Inserted);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get(&PeerId::from("a")).unwrap().trust_score, TRUST_PRIOR);
    }

    #[tokio::test(start_paused = true)]
    async fn list_orders_by_trust_then_vram() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        reg.report(report("a", 8_000)).await.unwrap();
        reg.report(report("b", 16_000)).await.unwrap();
        reg.report(report("c", 12_000)).await.unwrap();
        reg.set_trust(&PeerId::from("c"), 0.9, 0).await.unwrap();

        let ids: Vec<_> = reg
            .list(&ResourceRequirement::vram(1))
            .into_iter()
            .map(|r| r.peer_id.0)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let floor: Vec<_> = reg
            .list(&ResourceRequirement::vram(10_000))
            .into_iter()
            .map(|r| r.peer_id.0)
            .collect();
        assert_eq!(floor, vec!["c", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_breaks_ties() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        reg.report(report("a", 8_000)).await.unwrap();
        reg.report(report("b", 8_000)).await.unwrap();
        reg.observe_latency(&PeerId::from("a"), Duration::from_millis(80))
            .await
            .unwrap();
        reg.observe_latency(&PeerId::from("b"), Duration::from_millis(20))
            .await
            .unwrap();
        let first = &reg.list(&ResourceRequirement::default())[0];
        assert_eq!(first.peer_id, PeerId::from("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_excluded_until_it_reports() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        reg.report(report("a", 8_000)).await.unwrap();
        reg.report(report("b", 8_000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(reg.heartbeat(&PeerId::from("b")).await.unwrap());
        tokio::time::advance(Duration::from_millis(1_500)).await;

        // a: silent 3.5s > 3s liveness; b heard from 1.5s ago.
        let live: Vec<_> = reg
            .list(&ResourceRequirement::default())
            .into_iter()
            .map(|r| r.peer_id.0)
            .collect();
        assert_eq!(live, vec!["b"]);

        // A late heartbeat does not revive a.
        assert!(!reg.heartbeat(&PeerId::from("a")).await.unwrap());
        assert_eq!(reg.list(&ResourceRequirement::default()).len(), 1);

        reg.report(report("a", 8_000)).await.unwrap();
        assert_eq!(reg.list(&ResourceRequirement::default()).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_marks_then_purges() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        reg.report(report("a", 8_000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(4_000)).await;
        let stats = reg.sweep().await.unwrap();
        assert!(!reg.snapshot().get(&PeerId::from("a")).unwrap().reachable);
        // The periodic sweep may already have marked it.
        assert!(stats.marked_unreachable <= 1);

        tokio::time::advance(Duration::from_millis(7_000)).await;
        reg.sweep().await.unwrap();
        assert!(reg.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reordered_report_is_ignored() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        let old = report("a", 1_000);
        let mut new = report("a", 9_000);
        new.capability.reported_at = old.capability.reported_at + chrono::Duration::seconds(5);
        reg.report(new).await.unwrap();
        assert_eq!(reg.report(old).await.unwrap(), ReportOutcome::Stale);
        let snap = reg.snapshot();
        assert_eq!(snap.get(&PeerId::from("a")).unwrap().capability.vram_free_mb, 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_report_does_not_revive_silent_peer() {
        let (reg, _task) = PeerRegistry::spawn(&config());
        let original = report("a", 8_000);
        reg.report(original.clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(4_000)).await;
        reg.sweep().await.unwrap();
        assert!(reg.list(&ResourceRequirement::default()).is_empty());

        assert_eq!(reg.report(original).await.unwrap(), ReportOutcome::Stale);
        assert!(reg.list(&ResourceRequirement::default()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_heartbeat_ignored_and_shutdown_stops() {
        let (reg, task) = PeerRegistry::spawn(&config());
        assert!(!reg.heartbeat(&PeerId::from("ghost")).await.unwrap());
        assert!(reg.snapshot().is_empty());

        reg.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(
            reg.report(report("a", 1)).await.unwrap_err(),
            RegistryError::Stopped
        );
    }
}
