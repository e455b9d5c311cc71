//! Node identity: an ed25519 key pair whose public half is the [`PeerId`].

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use gpulend_ledger::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to gather randomness: {0}")]
    Entropy(String),

    #[error("malformed key material: {0}")]
    MalformedKey(String),

    #[error("malformed peer id {0}")]
    MalformedPeerId(String),

    #[error("bad signature from {0}")]
    BadSignature(String),

    #[error("undecodable payload: {0}")]
    Payload(String),

    #[error("envelope sent at {0} is outside the accepted clock skew")]
    Stale(String),

    #[error("key file io: {0}")]
    Io(#[from] std::io::Error),
}

/// Signing identity of the local node.
pub struct PeerIdentity {
    signing: SigningKey,
    peer_id: PeerId,
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl PeerIdentity {
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| IdentityError::Entropy(e.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let peer_id = PeerId(hex::encode(signing.verifying_key().to_bytes()));
        Self { signing, peer_id }
    }

    /// Load a hex-encoded seed written by [`PeerIdentity::save`].
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)?;
        let bytes =
            hex::decode(text.trim()).map_err(|e| IdentityError::MalformedKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::MalformedKey("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    /// Load from `path` if given and present, otherwise generate a fresh key.
    pub fn load_or_generate(path: Option<&Path>) -> Result<Self, IdentityError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::warn!(path = %p.display(), "key file missing, using an ephemeral identity");
                Self::generate()
            }
            None => Self::generate(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.signing.to_bytes()))?;
        Ok(())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Hex-encoded signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> String {
        hex::encode(self.signing.sign(msg).to_bytes())
    }
}

/// Verify a hex signature over `msg` against the key encoded in `peer`.
pub fn verify(peer: &PeerId, msg: &[u8], signature_hex: &str) -> Result<(), IdentityError> {
    let key_bytes: [u8; 32] = hex::decode(peer.as_str())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| IdentityError::MalformedPeerId(peer.to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| IdentityError::MalformedPeerId(peer.to_string()))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| IdentityError::BadSignature(peer.short().to_string()))?;
    key.verify(msg, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| IdentityError::BadSignature(peer.short().to_string()))
}
