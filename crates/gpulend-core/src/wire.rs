//! Peer-to-peer protocol messages and their signed envelope.

use chrono::{DateTime, Duration, Utc};
use gpulend_ledger::{JobId, Outcome, PeerId, ResourceUsage};
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactRef, Capability, ExecutionLogs, PayloadRef, ResourceRequirement};
use crate::identity::{self, IdentityError, PeerIdentity};

/// Network address of a peer's protocol endpoint (`http://host:port` or
/// `local://name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub peer_id: PeerId,
    pub addresses: Vec<PeerAddress>,
    pub capability: Capability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub peer_id: PeerId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOffer {
    pub job_id: JobId,
    pub requester: PeerId,
    /// Where progress pings and the terminal report go.
    pub reply_to: PeerAddress,
    pub requirement: ResourceRequirement,
    pub payload: PayloadRef,
    pub time_budget_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferResponse {
    pub job_id: JobId,
    pub decision: Decision,
    pub reason: Option<String>,
}

impl OfferResponse {
    pub fn accept(job_id: JobId) -> Self {
        Self {
            job_id,
            decision: Decision::Accept,
            reason: None,
        }
    }

    pub fn decline(job_id: JobId, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            decision: Decision::Decline,
            reason: Some(reason.into()),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPing {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub percent: Option<f32>,
    pub phase: Option<String>,
    /// Set once the execution may have had effects outside its sandbox.
    #[serde(default)]
    pub side_effects: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub job_id: JobId,
    pub outcome: Outcome,
    pub output_ref: Option<String>,
    pub detail: Option<String>,
    pub consumed: ResourceUsage,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Option<ExecutionLogs>,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Capability(CapabilityReport),
    Heartbeat(Heartbeat),
    Offer(JobOffer),
    Start { job_id: JobId },
    Cancel { job_id: JobId },
    Progress(ProgressPing),
    Terminal(TerminalReport),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Capability(_) => "capability",
            WireMessage::Heartbeat(_) => "heartbeat",
            WireMessage::Offer(_) => "offer",
            WireMessage::Start { .. } => "start",
            WireMessage::Cancel { .. } => "cancel",
            WireMessage::Progress(_) => "progress",
            WireMessage::Terminal(_) => "terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireReply {
    Ack,
    Offer(OfferResponse),
    Rejected { reason: String },
}

impl WireReply {
    pub fn rejected(reason: impl Into<String>) -> Self {
        WireReply::Rejected {
            reason: reason.into(),
        }
    }
}

/// A message signed by its sender. The signature covers
/// `"{sender}\n{sent_at}\n{payload}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub sender: PeerId,
    pub sent_at: DateTime<Utc>,
    pub payload: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn seal(identity: &PeerIdentity, message: &WireMessage) -> Result<Self, IdentityError> {
        let payload =
            serde_json::to_string(message).map_err(|e| IdentityError::Payload(e.to_string()))?;
        let sender = identity.peer_id().clone();
        let sent_at = Utc::now();
        let signature = identity.sign(signing_input(&sender, &sent_at, &payload).as_bytes());
        Ok(Self {
            sender,
            sent_at,
            payload,
            signature,
        })
    }

    /// Verify the signature, then decode the payload.
    pub fn open(&self) -> Result<WireMessage, IdentityError> {
        identity::verify(
            &self.sender,
            signing_input(&self.sender, &self.sent_at, &self.payload).as_bytes(),
            &self.signature,
        )?;
        serde_json::from_str(&self.payload).map_err(|e| IdentityError::Payload(e.to_string()))
    }

    /// Reject envelopes whose `sent_at` lies further than `max_skew` from
    /// `now` in either direction.
    pub fn check_fresh(&self, now: DateTime<Utc>, max_skew: Duration) -> Result<(), IdentityError> {
        let skew = if now >= self.sent_at {
            now - self.sent_at
        } else {
            self.sent_at - now
        };
        if skew > max_skew {
            return Err(IdentityError::Stale(self.sent_at.to_rfc3339()));
        }
        Ok(())
    }
}

fn signing_input(sender: &PeerId, sent_at: &DateTime<Utc>, payload: &str) -> String {
    format!("{sender}\n{}\n{payload}", sent_at.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> WireMessage {
        WireMessage::Cancel {
            job_id: JobId::from("job-1"),
        }
    }

    #[test]
    fn sealed_envelope_opens() {
        let id = PeerIdentity::from_seed([3u8; 32]);
        let env = SignedEnvelope::seal(&id, &cancel()).unwrap();
        assert_eq!(&env.sender, id.peer_id());
        assert_eq!(env.open().unwrap(), cancel());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let id = PeerIdentity::from_seed([3u8; 32]);
        let mut env = SignedEnvelope::seal(&id, &cancel()).unwrap();
        env.payload = env.payload.replace("job-1", "job-2");
        assert!(matches!(env.open(), Err(IdentityError::BadSignature(_))));
    }

    #[test]
    fn spoofed_sender_is_rejected() {
        let id = PeerIdentity::from_seed([3u8; 32]);
        let other = PeerIdentity::from_seed([4u8; 32]);
        let mut env = SignedEnvelope::seal(&id, &cancel()).unwrap();
        env.sender = other.peer_id().clone();
        assert!(env.open().is_err());
    }

    #[test]
    fn old_and_future_envelopes_are_stale() {
        let id = PeerIdentity::from_seed([3u8; 32]);
        let env = SignedEnvelope::seal(&id, &cancel()).unwrap();
        let skew = Duration::seconds(30);
        env.check_fresh(env.sent_at + Duration::seconds(29), skew).unwrap();
        assert!(matches!(
            env.check_fresh(env.sent_at + Duration::seconds(31), skew),
            Err(IdentityError::Stale(_))
        ));
        assert!(env.check_fresh(env.sent_at - Duration::seconds(31), skew).is_err());
    }

    #[test]
    fn envelope_survives_json_transit() {
        let id = PeerIdentity::from_seed([5u8; 32]);
        let env = SignedEnvelope::seal(&id, &cancel()).unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let back: SignedEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.open().unwrap(), cancel());
    }
}
