use std::time::Duration;

use async_trait::async_trait;

use super::{PeerTransport, TransportError};
use crate::wire::{PeerAddress, SignedEnvelope, WireReply};

/// Posts envelopes to `{addr}/v1/envelope` on the peer's daemon.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

pub(crate) fn envelope_url(addr: &PeerAddress) -> String {
    format!("{}/v1/envelope", addr.as_str().trim_end_matches('/'))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send(
        &self,
        to: &PeerAddress,
        envelope: SignedEnvelope,
    ) -> Result<WireReply, TransportError> {
        let resp = self
            .client
            .post(envelope_url(to))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Unreachable(to.to_string())
                } else if e.is_timeout() {
                    TransportError::Timeout {
                        addr: to.to_string(),
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("{to} answered {status}")));
        }
        resp.json::<WireReply>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_url_strips_trailing_slash() {
        assert_eq!(
            envelope_url(&"http://10.0.0.5:7070/".into()),
            "http://10.0.0.5:7070/v1/envelope"
        );
    }

    #[tokio::test]
    async fn closed_port_fails() {
        let t = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let id = crate::identity::PeerIdentity::from_seed([1u8; 32]);
        let env = SignedEnvelope::seal(
            &id,
            &crate::wire::WireMessage::Cancel { job_id: "j".into() },
        )
        .unwrap();
        // Port 9 (discard) is closed on test hosts.
        assert!(t.send(&"http://127.0.0.1:9".into(), env).await.is_err());
    }
}
