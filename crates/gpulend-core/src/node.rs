//! Node composition: wires registry, matcher, dispatcher, supervisor and
//! reporter around one identity, and routes inbound envelopes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpulend_ledger::{JobId, Ledger, PeerId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::domain::{Capability, JobRequest, PayloadRef, ResourceRequirement};
use crate::identity::PeerIdentity;
use crate::metrics::METRICS;
use crate::probe::CapabilityProbe;
use crate::registry::{PeerRegistry, RegistryHandle, ReportOutcome};
use crate::reporter::{CapabilityReporter, TickSummary};
use crate::supervisor::{RecoveryReport, SandboxBackend, Supervisor};
use crate::transport::{EnvelopeHandler, Messenger, PeerTransport};
use crate::wire::{PeerAddress, SignedEnvelope, WireMessage, WireReply};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Pluggable collaborators of a node.
pub struct NodeParts {
    pub identity: PeerIdentity,
    pub transport: Arc<dyn PeerTransport>,
    pub backend: Arc<dyn SandboxBackend>,
    pub probe: Arc<dyn CapabilityProbe>,
    pub ledger: Arc<dyn Ledger>,
}

pub struct Node {
    config: NodeConfig,
    address: PeerAddress,
    identity: Arc<PeerIdentity>,
    registry: RegistryHandle,
    dispatcher: Dispatcher,
    supervisor: Supervisor,
    reporter: CapabilityReporter,
    router: Arc<NodeRouter>,
    ledger: Arc<dyn Ledger>,
    recovery: RecoveryReport,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Validate the config, sweep orphaned sandboxes, and start the
    /// registry and reporter tasks.
    pub async fn start(config: NodeConfig, parts: NodeParts) -> crate::Result<Self> {
        config.validate()?;
        let identity = Arc::new(parts.identity);
        let address = PeerAddress(config.advertise.clone());
        let (registry, registry_task) = PeerRegistry::spawn(&config.registry);
        let messenger = Messenger::new(
            Arc::clone(&identity),
            parts.transport,
            config.transport_timeout(),
        );

        let mut supervisor_config = config.supervisor.clone();
        supervisor_config.artifact_base_url = Some(config.advertise.clone());
        let supervisor = Supervisor::new(
            supervisor_config,
            parts.backend,
            parts.probe,
            Arc::clone(&parts.ledger),
            messenger.clone(),
        );
        let recovery = supervisor.recover_orphans().await?;

        let dispatcher = Dispatcher::new(
            address.clone(),
            config.dispatch.clone(),
            registry.clone(),
            messenger.clone(),
            Arc::clone(&parts.ledger),
        );
        let router = Arc::new(NodeRouter {
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
            supervisor: supervisor.clone(),
            ledger: Arc::clone(&parts.ledger),
            max_skew: config.max_clock_skew(),
            liveness_marks: Mutex::new(HashMap::new()),
        });
        let bootstrap = config
            .bootstrap
            .iter()
            .map(|a| PeerAddress(a.clone()))
            .collect();
        let reporter = CapabilityReporter::new(
            address.clone(),
            bootstrap,
            &config.registry,
            supervisor.clone(),
            registry.clone(),
            messenger,
        );
        let (stop, stop_rx) = watch::channel(false);
        let reporter_task = reporter.spawn(stop_rx);

        tracing::info!(
            peer_id = %identity.peer_id(),
            address = %address,
            backend = supervisor.backend().name(),
            "node started"
        );

        Ok(Self {
            config,
            address,
            identity,
            registry,
            dispatcher,
            supervisor,
            reporter,
            router,
            ledger: parts.ledger,
            recovery,
            stop,
            tasks: Mutex::new(vec![registry_task, reporter_task]),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Inbound handler to register with a transport server.
    pub fn router(&self) -> Arc<NodeRouter> {
        Arc::clone(&self.router)
    }

    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    pub async fn local_capability(&self) -> Capability {
        self.supervisor.local_capability().await
    }

    /// Announce the current capability now instead of waiting for the
    /// next interval.
    pub async fn report_now(&self) -> TickSummary {
        self.reporter.tick().await
    }

    /// Submit a job as this node.
    pub async fn submit(
        &self,
        requirement: ResourceRequirement,
        payload: PayloadRef,
        time_budget: Duration,
    ) -> DispatchResult<JobId> {
        let request = JobRequest::new(self.peer_id().clone(), requirement, payload, time_budget);
        self.dispatcher.submit(request).await
    }

    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        self.dispatcher.shutdown(SHUTDOWN_WAIT).await;
        self.supervisor.shutdown(SHUTDOWN_WAIT).await;
        if let Err(e) = self.registry.shutdown().await {
            tracing::debug!(error = %e, "registry already stopped");
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.ledger.flush().await {
            tracing::warn!(error = %e, "ledger flush failed");
        }
        METRICS.flush();
        tracing::info!(peer_id = %self.peer_id().short(), "node stopped");
    }
}

/// Verifies inbound envelopes and routes each message to its component.
pub struct NodeRouter {
    registry: RegistryHandle,
    dispatcher: Dispatcher,
    supervisor: Supervisor,
    ledger: Arc<dyn Ledger>,
    max_skew: chrono::Duration,
    /// Newest accepted `sent_at` of each sender's liveness messages.
    liveness_marks: Mutex<HashMap<PeerId, DateTime<Utc>>>,
}

impl NodeRouter {
    /// Accept a capability report or heartbeat only when it is newer than
    /// the last one taken from the same sender.
    fn advance_liveness_mark(&self, sender: &PeerId, sent_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut marks = self.liveness_marks.lock().unwrap_or_else(|e| e.into_inner());
        // anything at or below a mark this old already fails the skew check
        let horizon = now - self.max_skew;
        marks.retain(|_, mark| *mark >= horizon);
        match marks.get(sender) {
            Some(mark) if sent_at <= *mark => false,
            _ => {
                marks.insert(sender.clone(), sent_at);
                true
            }
        }
    }

    /// Load a newly seen peer's trust from local history.
    async fn seed_trust(&self, peer: &PeerId) {
        let (Ok(score), Ok(failures)) = (
            self.ledger.trust_score(peer).await,
            self.ledger.recent_failures(peer).await,
        ) else {
            return;
        };
        if let Err(e) = self.registry.set_trust(peer, score, failures).await {
            tracing::debug!(error = %e, "trust not seeded");
        }
    }
}

#[async_trait]
impl EnvelopeHandler for NodeRouter {
    async fn handle(&self, envelope: SignedEnvelope) -> WireReply {
        let message = match envelope.open() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(sender = %envelope.sender.short(), error = %e, "envelope rejected");
                return WireReply::rejected(format!("bad envelope: {e}"));
            }
        };
        let now = Utc::now();
        if let Err(e) = envelope.check_fresh(now, self.max_skew) {
            tracing::warn!(sender = %envelope.sender.short(), error = %e, "envelope rejected");
            return WireReply::rejected(e.to_string());
        }
        let sent_at = envelope.sent_at;
        let sender = envelope.sender;
        tracing::trace!(kind = message.kind(), sender = %sender.short(), "envelope received");
        if matches!(message, WireMessage::Capability(_) | WireMessage::Heartbeat(_))
            && !self.advance_liveness_mark(&sender, sent_at, now)
        {
            tracing::warn!(sender = %sender.short(), kind = message.kind(), "replayed liveness message dropped");
            return WireReply::rejected("liveness message is not newer than the last one accepted");
        }

        match message {
            WireMessage::Capability(report) => {
                if report.peer_id != sender {
                    return WireReply::rejected("report peer id does not match sender");
                }
                match self.registry.report(report).await {
                    Ok(ReportOutcome::Inserted) => {
                        self.seed_trust(&sender).await;
                        WireReply::Ack
                    }
                    Ok(_) => WireReply::Ack,
                    Err(e) => WireReply::rejected(e.to_string()),
                }
            }
            WireMessage::Heartbeat(beat) => {
                if beat.peer_id != sender {
                    return WireReply::rejected("heartbeat peer id does not match sender");
                }
                match self.registry.heartbeat(&sender).await {
                    Ok(true) => WireReply::Ack,
                    Ok(false) => WireReply::rejected("unknown or expired peer; send a full report"),
                    Err(e) => WireReply::rejected(e.to_string()),
                }
            }
            WireMessage::Offer(offer) => {
                if offer.requester != sender {
                    return WireReply::rejected("offer requester does not match sender");
                }
                WireReply::Offer(self.supervisor.accept(offer).await)
            }
            WireMessage::Start { job_id } => match self.supervisor.run(&job_id, &sender).await {
                Ok(()) => WireReply::Ack,
                Err(e) => WireReply::rejected(e.to_string()),
            },
            WireMessage::Cancel { job_id } => {
                self.supervisor.cancel(&job_id, &sender).await;
                WireReply::Ack
            }
            WireMessage::Progress(ping) => {
                if self.dispatcher.handle_progress(&sender, ping) {
                    WireReply::Ack
                } else {
                    WireReply::rejected("no live session assigned to sender")
                }
            }
            WireMessage::Terminal(report) => {
                if self.dispatcher.handle_terminal(&sender, report) {
                    WireReply::Ack
                } else {
                    WireReply::rejected("no live session assigned to sender")
                }
            }
        }
    }
}
