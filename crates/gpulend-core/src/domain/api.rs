//! Request and response bodies of the daemon's control API, shared by the
//! daemon and the CLI.

use gpulend_ledger::{JobId, LedgerEntry, LedgerSummary, PeerId};
use serde::{Deserialize, Serialize};

use super::{Capability, PayloadRef, ResourceRequirement};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub requirement: ResourceRequirement,
    pub payload: PayloadRef,
    pub time_budget_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    /// False when the session had already finished.
    pub requested: bool,
}

/// One registry record as shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
    pub capability: Capability,
    pub reachable: bool,
    pub silent_ms: u64,
    pub trust_score: f64,
    pub recent_failures: u32,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerView {
    pub summary: LedgerSummary,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
}
