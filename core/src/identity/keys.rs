// Cryptographic key management: libp2p identity keys

use anyhow::{Context, Result};
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;

/// Identity keys (ed25519) and the peer id derived from them.
///
/// The peer id is what other nodes see as our `node_id`; it is always
/// recomputed from the public key so the two can never drift apart.
#[derive(Clone)]
pub struct IdentityKeys {
    keypair: Keypair,
    peer_id: PeerId,
}

impl IdentityKeys {
    /// Generate new random identity keys
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Deterministic keys from a single seed byte.
    ///
    /// Only meant for demos and tests where several nodes need stable,
    /// well-known peer ids.
    pub fn from_seed(seed: u8) -> Result<Self> {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        let keypair = Keypair::ed25519_from_bytes(bytes).context("Invalid ed25519 seed")?;
        Ok(Self::from_keypair(keypair))
    }

    /// Keys from a hex-encoded 32-byte ed25519 secret
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim()).context("Secret key is not valid hex")?;
        let keypair = Keypair::ed25519_from_bytes(bytes).context("Invalid ed25519 secret key")?;
        Ok(Self::from_keypair(keypair))
    }

    /// Wrap an existing libp2p keypair
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// Protobuf encoding of the public key, as carried in `node_public_key`
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.keypair.public().encode_protobuf()
    }

    /// Sign data
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, libp2p::identity::SigningError> {
        self.keypair.sign(data)
    }

    /// Verify signature against a protobuf-encoded public key
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
        let public_key =
            PublicKey::try_decode_protobuf(public_key).context("Invalid public key")?;
        Ok(public_key.verify(data, signature))
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keys = IdentityKeys::generate();
        assert_eq!(keys.peer_id(), keys.public_key().to_peer_id());
        assert!(!keys.public_key_bytes().is_empty());
    }

    #[test]
    fn test_seeded_keys_are_stable() {
        let a = IdentityKeys::from_seed(1).unwrap();
        let b = IdentityKeys::from_seed(1).unwrap();
        let c = IdentityKeys::from_seed(2).unwrap();

        assert_eq!(a.peer_id(), b.peer_id());
        assert_ne!(a.peer_id(), c.peer_id());
    }

    #[test]
    fn test_verification() {
        let keys = IdentityKeys::generate();
        let data = b"test message";

        let signature = keys.sign(data).unwrap();
        assert_eq!(signature.len(), 64); // Ed25519 signature = 64 bytes

        let public_key = keys.public_key_bytes();
        assert!(IdentityKeys::verify(data, &signature, &public_key).unwrap());
        assert!(!IdentityKeys::verify(b"wrong data", &signature, &public_key).unwrap());
    }

    #[test]
    fn test_verify_rejects_garbage_key() {
        assert!(IdentityKeys::verify(b"data", &[0u8; 64], &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let hex_secret = "01".repeat(32);
        let a = IdentityKeys::from_secret_hex(&hex_secret).unwrap();
        let b = IdentityKeys::from_secret_hex(&hex_secret).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());

        assert!(IdentityKeys::from_secret_hex("zz").is_err());
        assert!(IdentityKeys::from_secret_hex("0102").is_err());
    }
}
