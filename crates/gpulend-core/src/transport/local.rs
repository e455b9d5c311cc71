use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{EnvelopeHandler, PeerTransport, TransportError};
use crate::wire::{PeerAddress, SignedEnvelope, WireReply};

/// In-process network connecting several nodes by address. Partitioned
/// addresses can neither send nor receive.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<PeerAddress, Arc<dyn EnvelopeHandler>>>,
    partitioned: RwLock<HashSet<PeerAddress>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: PeerAddress, handler: Arc<dyn EnvelopeHandler>) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, handler);
    }

    pub fn unregister(&self, addr: &PeerAddress) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    pub fn partition(&self, addr: &PeerAddress) {
        self.partitioned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr.clone());
    }

    pub fn heal(&self, addr: &PeerAddress) {
        self.partitioned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    fn is_partitioned(&self, addr: &PeerAddress) -> bool {
        self.partitioned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(addr)
    }

    /// A transport that sends from `from` over this network.
    pub fn transport(self: &Arc<Self>, from: PeerAddress) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: Arc::clone(self),
            from,
        })
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: PeerAddress,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send(
        &self,
        to: &PeerAddress,
        envelope: SignedEnvelope,
    ) -> Result<WireReply, TransportError> {
        if self.network.is_partitioned(&self.from) || self.network.is_partitioned(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        let handler = self
            .network
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
        Ok(handler.handle(envelope).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;
    use crate::wire::WireMessage;

    struct Echo;

    #[async_trait]
    impl EnvelopeHandler for Echo {
        async fn handle(&self, envelope: SignedEnvelope) -> WireReply {
            match envelope.open() {
                Ok(_) => WireReply::Ack,
                Err(e) => WireReply::rejected(e.to_string()),
            }
        }
    }

    fn envelope() -> SignedEnvelope {
        let id = PeerIdentity::from_seed([1u8; 32]);
        SignedEnvelope::seal(
            &id,
            &WireMessage::Cancel {
                job_id: "j".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn partition_blocks_both_directions_until_healed() {
        let net = LocalNetwork::new();
        let a: PeerAddress = "local://a".into();
        let b: PeerAddress = "local://b".into();
        net.register(a.clone(), Arc::new(Echo));
        net.register(b.clone(), Arc::new(Echo));
        let from_a = net.transport(a.clone());
        let from_b = net.transport(b.clone());

        assert_eq!(from_a.send(&b, envelope()).await.unwrap(), WireReply::Ack);

        net.partition(&a);
        assert!(from_a.send(&b, envelope()).await.is_err());
        assert!(from_b.send(&a, envelope()).await.is_err());

        net.heal(&a);
        assert_eq!(from_b.send(&a, envelope()).await.unwrap(), WireReply::Ack);
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let net = LocalNetwork::new();
        let t = net.transport("local://a".into());
        let err = t.send(&"local://nobody".into(), envelope()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
