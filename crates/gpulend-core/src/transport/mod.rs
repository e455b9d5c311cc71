//! Outbound peer messaging.
//!
//! A [`PeerTransport`] moves signed envelopes to an address and returns the
//! remote reply. [`Messenger`] pairs a transport with the local identity so
//! callers deal in plain [`WireMessage`]s, and adds per-call timeouts and
//! retry with exponential backoff.

mod http;
mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpulend_ledger::PeerId;

use crate::identity::{IdentityError, PeerIdentity};
use crate::wire::{PeerAddress, SignedEnvelope, WireMessage, WireReply};

pub use http::HttpTransport;
pub use local::{LocalNetwork, LocalTransport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer at {0} is unreachable")]
    Unreachable(String),

    #[error("request to {addr} timed out after {after_ms}ms")]
    Timeout { addr: String, after_ms: u64 },

    #[error("http error: {0}")]
    Http(String),

    #[error("could not sign message: {0}")]
    Sign(#[from] IdentityError),
}

/// Delivers a signed envelope to a peer address and returns its reply.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(
        &self,
        to: &PeerAddress,
        envelope: SignedEnvelope,
    ) -> Result<WireReply, TransportError>;
}

/// Inbound side: verifies and routes an envelope, producing the reply.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: SignedEnvelope) -> WireReply;
}

/// Retry schedule for message delivery.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff_base: Duration,
}

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff_base: Duration::ZERO,
        }
    }

    /// Sleep after the `attempt`-th failure (1-based): doubles from
    /// `backoff_base`, capped at [`MAX_BACKOFF`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Signs and sends messages on behalf of the local node.
#[derive(Clone)]
pub struct Messenger {
    identity: Arc<PeerIdentity>,
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl Messenger {
    pub fn new(
        identity: Arc<PeerIdentity>,
        transport: Arc<dyn PeerTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            transport,
            timeout,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub async fn send(
        &self,
        to: &PeerAddress,
        message: &WireMessage,
    ) -> Result<WireReply, TransportError> {
        let envelope = SignedEnvelope::seal(&self.identity, message)?;
        match tokio::time::timeout(self.timeout, self.transport.send(to, envelope)).await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Timeout {
                addr: to.to_string(),
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Send with exponential backoff between failed attempts. A
    /// `Rejected` reply is final and not retried.
    pub async fn send_with_retry(
        &self,
        to: &PeerAddress,
        message: &WireMessage,
        policy: RetryPolicy,
    ) -> Result<WireReply, TransportError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send(to, message).await {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        to = %to,
                        kind = message.kind(),
                        attempt,
                        error = %err,
                        "delivery failed, backing off"
                    );
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
