//! Capability Reporter.
//!
//! Once per heartbeat interval the reporter samples the local capability
//! (through the supervisor, which adds slot usage and sandbox availability),
//! records it in the local registry and announces it to every known peer.
//! A full report goes out when resources changed, every
//! `full_report_every` ticks, and to any peer that answers a heartbeat with
//! `Rejected` (it has not heard from us, or has timed us out). Otherwise a
//! cheap heartbeat refreshes liveness.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RegistryConfig;
use crate::domain::Capability;
use crate::registry::RegistryHandle;
use crate::supervisor::Supervisor;
use crate::transport::Messenger;
use crate::wire::{CapabilityReport, Heartbeat, PeerAddress, WireMessage, WireReply};

#[derive(Default)]
struct ReporterState {
    ticks: u64,
    last_sent: Option<Capability>,
}

struct Inner {
    address: PeerAddress,
    bootstrap: Vec<PeerAddress>,
    interval: Duration,
    full_report_every: u64,
    supervisor: Supervisor,
    registry: RegistryHandle,
    messenger: Messenger,
    state: Mutex<ReporterState>,
}

/// What one tick did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub full: bool,
    pub targets: usize,
    pub delivered: usize,
    pub re_reported: usize,
}

#[derive(Clone)]
pub struct CapabilityReporter {
    inner: Arc<Inner>,
}

impl CapabilityReporter {
    pub fn new(
        address: PeerAddress,
        bootstrap: Vec<PeerAddress>,
        config: &RegistryConfig,
        supervisor: Supervisor,
        registry: RegistryHandle,
        messenger: Messenger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                bootstrap,
                interval: config.heartbeat_interval(),
                full_report_every: u64::from(config.full_report_every.max(1)),
                supervisor,
                registry,
                messenger,
                state: Mutex::new(ReporterState::default()),
            }),
        }
    }

    /// Sample, record locally, and announce once.
    pub async fn tick(&self) -> TickSummary {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let capability = inner.supervisor.local_capability().await;
        let report = CapabilityReport {
            peer_id: inner.messenger.peer_id().clone(),
            addresses: vec![inner.address.clone()],
            capability: capability.clone(),
        };
        if let Err(e) = inner.registry.report(report.clone()).await {
            tracing::warn!(error = %e, "could not record own capability");
        }
        inner.supervisor.note_reported(capability.clone()).await;

        let changed = state
            .last_sent
            .as_ref()
            .map_or(true, |prev| !prev.same_resources(&capability));
        let full = changed || state.ticks % inner.full_report_every == 0;
        state.ticks += 1;
        state.last_sent = Some(capability);

        let targets = self.targets();
        let results = join_all(targets.iter().map(|to| self.announce(to, &report, full))).await;
        let summary = TickSummary {
            full,
            targets: targets.len(),
            delivered: results.iter().filter(|r| r.is_some()).count(),
            re_reported: results.iter().filter(|r| **r == Some(true)).count(),
        };
        tracing::debug!(
            full = summary.full,
            targets = summary.targets,
            delivered = summary.delivered,
            "capability announced"
        );
        summary
    }

    fn targets(&self) -> Vec<PeerAddress> {
        let inner = &self.inner;
        let known = inner.registry.snapshot().addresses_except(inner.messenger.peer_id());
        let set: BTreeSet<PeerAddress> = known
            .into_iter()
            .chain(inner.bootstrap.iter().cloned())
            .filter(|a| a != &inner.address)
            .collect();
        set.into_iter().collect()
    }

    /// Returns `None` when undelivered, `Some(true)` when a rejected
    /// heartbeat was followed by a full report.
    async fn announce(&self, to: &PeerAddress, report: &CapabilityReport, full: bool) -> Option<bool> {
        let messenger = &self.inner.messenger;
        let full_report = WireMessage::Capability(report.clone());
        if full {
            return match messenger.send(to, &full_report).await {
                Ok(_) => Some(false),
                Err(e) => {
                    tracing::debug!(to = %to, error = %e, "capability report not delivered");
                    None
                }
            };
        }
        let beat = WireMessage::Heartbeat(Heartbeat {
            peer_id: messenger.peer_id().clone(),
            sent_at: Utc::now(),
        });
        match messenger.send(to, &beat).await {
            Ok(WireReply::Rejected { reason }) => {
                tracing::debug!(to = %to, reason = %reason, "heartbeat rejected, re-reporting");
                messenger.send(to, &full_report).await.ok().map(|_| true)
            }
            Ok(_) => Some(false),
            Err(e) => {
                tracing::debug!(to = %to, error = %e, "heartbeat not delivered");
                None
            }
        }
    }

    /// Tick every heartbeat interval until `shutdown` flips to true.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let mut every = tokio::time::interval(reporter.inner.interval);
            every.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = every.tick() => {
                        reporter.tick().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
