// Envelope signing and authentication

use super::codec::signing_bytes;
use super::types::{MessageData, Signed};
use crate::identity::IdentityKeys;
use libp2p::identity::PublicKey;
use libp2p::PeerId;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Failed to encode message for signing: {0}")]
    Encode(#[from] bincode::Error),
    #[error("Signing with local key failed: {0}")]
    Key(#[from] libp2p::identity::SigningError),
}

/// Why a message failed authentication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("message carries no signature")]
    MissingSignature,
    #[error("node id is not a valid peer id")]
    InvalidNodeId,
    #[error("public key cannot be decoded")]
    InvalidPublicKey,
    #[error("public key does not belong to the claimed node id")]
    IdentityMismatch,
    #[error("message cannot be re-encoded")]
    Encoding,
    #[error("signature verification failed")]
    BadSignature,
}

/// Fresh envelope for a message sent by `keys`; the signature is left empty
pub fn new_message_data(
    keys: &IdentityKeys,
    client_version: &str,
    message_id: String,
    gossip: bool,
) -> MessageData {
    MessageData {
        client_version: client_version.to_string(),
        node_id: keys.peer_id().to_base58(),
        node_public_key: keys.public_key_bytes(),
        timestamp: unix_now(),
        message_id,
        gossip,
        signature: Vec::new(),
    }
}

/// Signature over the message encoded with an empty signature field
pub fn sign<M: Signed + Clone>(keys: &IdentityKeys, msg: &M) -> Result<Vec<u8>, SigningError> {
    let bytes = signing_bytes(msg)?;
    Ok(keys.sign(&bytes)?)
}

/// Clear, sign, then attach the signature
pub fn sign_in_place<M: Signed + Clone>(
    keys: &IdentityKeys,
    msg: &mut M,
) -> Result<(), SigningError> {
    msg.message_data_mut().signature.clear();
    let signature = sign(keys, msg)?;
    msg.message_data_mut().signature = signature;
    Ok(())
}

/// Check the signature and that the signing key really owns `node_id`
pub fn verify<M: Signed + Clone>(msg: &M) -> Result<PeerId, AuthFailure> {
    let data = msg.message_data();
    if data.signature.is_empty() {
        return Err(AuthFailure::MissingSignature);
    }

    let claimed = PeerId::from_str(&data.node_id).map_err(|_| AuthFailure::InvalidNodeId)?;
    let public_key = PublicKey::try_decode_protobuf(&data.node_public_key)
        .map_err(|_| AuthFailure::InvalidPublicKey)?;
    if public_key.to_peer_id() != claimed {
        return Err(AuthFailure::IdentityMismatch);
    }

    let bytes = signing_bytes(msg).map_err(|_| AuthFailure::Encoding)?;
    if !public_key.verify(&bytes, &data.signature) {
        return Err(AuthFailure::BadSignature);
    }
    Ok(claimed)
}

/// `verify` as a plain yes/no; failures are logged, never propagated
pub fn authenticate<M: Signed + Clone>(msg: &M) -> bool {
    match verify(msg) {
        Ok(_) => true,
        Err(reason) => {
            tracing::warn!(
                node_id = %msg.message_data().node_id,
                message_id = %msg.message_data().message_id,
                %reason,
                "Message authentication failed"
            );
            false
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
