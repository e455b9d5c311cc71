//! GPULend Core Library
//!
//! Brokering and execution-supervision core for peer-to-peer GPU time
//! sharing: capability advertisement, peer registry, job matching, dispatch,
//! sandboxed execution, and outcome reconciliation into the ledger.
//!
//! Control flow:
//!
//! ```text
//! CapabilityReporter → PeerRegistry ← Matcher ← Dispatcher ⇄ (wire) ⇄ Supervisor → SandboxBackend
//!                                                  │
//!                                                  └→ Ledger
//! ```

pub mod config;
pub mod domain;
pub mod dispatcher;
pub mod error;
pub mod fakes;
pub mod identity;
pub mod matcher;
pub mod metrics;
pub mod node;
pub mod obs;
pub mod probe;
pub mod registry;
pub mod reporter;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use config::{
    DispatchConfig, LedgerConfig, NetworkPolicy, NodeConfig, ProbeConfig, RegistryConfig,
    SupervisorConfig,
};
pub use domain::{
    ArtifactRef, Capability, JobOutcome, JobRequest, JobSession, JobState, PayloadRef, ResourceRequirement,
    SessionEvent,
};
pub use dispatcher::{DispatchError, Dispatcher};
pub use error::{GpulendError, Result};
pub use identity::{IdentityError, PeerIdentity};
pub use matcher::{MatchError, Matcher};
pub use node::{Node, NodeParts, NodeRouter};
pub use probe::{CapabilityProbe, NvidiaSmiProbe, StaticProbe};
pub use registry::{PeerRecord, PeerRegistry, RegistryError, RegistryHandle, RegistrySnapshot};
pub use reporter::CapabilityReporter;
pub use supervisor::{
    Artifact, PodmanBackend, SandboxBackend, SandboxError, SandboxExit, SandboxHandle,
    SandboxSpec, Supervisor,
};
pub use transport::{
    EnvelopeHandler, HttpTransport, LocalNetwork, Messenger, PeerTransport, TransportError,
};
pub use wire::{SignedEnvelope, WireMessage, WireReply};

pub use gpulend_ledger::{
    ErrorClass, JobId, Ledger, LedgerEntry, LedgerError, LedgerSummary, MemoryLedger, Outcome,
    PeerId, ResourceUsage, SurrealLedger,
};

pub use metrics::METRICS;
pub use telemetry::{init_tracing, TelemetryError};

/// GPULend version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
