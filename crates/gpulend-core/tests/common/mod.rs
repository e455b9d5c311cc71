#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gpulend_core::fakes::{FakeBackend, Script};
use gpulend_core::transport::LocalNetwork;
use gpulend_core::wire::PeerAddress;
use gpulend_core::{
    JobState, MemoryLedger, Node, NodeConfig, NodeParts, PeerIdentity, SessionEvent, StaticProbe,
};
use gpulend_core::{JobId, PeerId};
use tokio::sync::broadcast;

pub const REQUESTER: &str = "local://requester";

pub struct TestNode {
    pub node: Node,
    pub backend: Arc<FakeBackend>,
    pub probe: Arc<StaticProbe>,
    pub ledger: Arc<MemoryLedger>,
}

impl TestNode {
    pub fn id(&self) -> &PeerId {
        self.node.peer_id()
    }

    pub fn addr(&self) -> PeerAddress {
        self.node.address().clone()
    }
}

pub fn config(addr: &str, bootstrap: &[&str]) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.advertise = addr.to_string();
    cfg.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();
    cfg.transport_timeout_ms = 1_000;
    cfg
}

pub async fn start_node(
    net: &Arc<LocalNetwork>,
    cfg: NodeConfig,
    seed: u8,
    probe: StaticProbe,
    backend: FakeBackend,
) -> TestNode {
    let addr = PeerAddress(cfg.advertise.clone());
    let backend = Arc::new(backend);
    let probe = Arc::new(probe);
    let ledger = Arc::new(MemoryLedger::new());
    let parts = NodeParts {
        identity: PeerIdentity::from_seed([seed; 32]),
        transport: net.transport(addr.clone()),
        backend: backend.clone(),
        probe: probe.clone(),
        ledger: ledger.clone(),
    };
    let node = Node::start(cfg, parts).await.unwrap();
    net.register(addr, node.router());
    TestNode {
        node,
        backend,
        probe,
        ledger,
    }
}

/// A node that submits but cannot execute.
pub async fn requester(net: &Arc<LocalNetwork>) -> TestNode {
    let backend = FakeBackend::default();
    backend.set_available(false);
    start_node(net, config(REQUESTER, &[]), 1, StaticProbe::gpu("none", 0, 0), backend).await
}

/// An executor announcing itself to the requester.
pub async fn executor(
    net: &Arc<LocalNetwork>,
    name: &str,
    seed: u8,
    probe: StaticProbe,
    script: Script,
) -> TestNode {
    let addr = format!("local://{name}");
    let node = start_node(
        net,
        config(&addr, &[REQUESTER]),
        seed,
        probe,
        FakeBackend::new(script),
    )
    .await;
    node.node.report_now().await;
    node
}

/// Free VRAM `free_mb` out of `total_mb`.
pub fn gpu(total_mb: u64, free_mb: u64, compute_units: u32) -> StaticProbe {
    let probe = StaticProbe::gpu("test-gpu", total_mb, compute_units);
    probe.update(|c| c.vram_free_mb = free_mb);
    probe
}

pub fn long_run() -> Script {
    Script::succeed(Duration::from_secs(3_600))
}

/// Wait for `job_id` to reach `state` on the event stream.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<SessionEvent>,
    job_id: &JobId,
    state: JobState,
) -> SessionEvent {
    loop {
        let event = events.recv().await.unwrap();
        if &event.job_id == job_id && event.state == state {
            return event;
        }
    }
}
