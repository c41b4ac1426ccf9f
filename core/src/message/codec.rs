// Message codec: bincode bodies in length-prefixed frames, with size limits

use super::types::Signed;
use anyhow::{bail, Result};
use serde::de::DeserializeOwned;

/// Maximum encoded frame size: 256 KB
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum application text: 64 KB
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Serialize a message into a wire frame (u32 big-endian length + bincode body)
pub fn encode_frame<M: Signed>(msg: &M) -> Result<Vec<u8>> {
    if msg.message().len() > MAX_PAYLOAD_SIZE {
        bail!(
            "Payload too large: {} bytes (max {})",
            msg.message().len(),
            MAX_PAYLOAD_SIZE
        );
    }

    let body = bincode::serialize(msg)?;
    let total = body.len() + LENGTH_PREFIX;
    if total > MAX_MESSAGE_SIZE {
        bail!(
            "Encoded message too large: {} bytes (max {})",
            total,
            MAX_MESSAGE_SIZE
        );
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Deserialize a complete wire frame
pub fn decode_frame<M: Signed + DeserializeOwned>(frame: &[u8]) -> Result<M> {
    if frame.len() > MAX_MESSAGE_SIZE {
        bail!(
            "Message too large: {} bytes (max {})",
            frame.len(),
            MAX_MESSAGE_SIZE
        );
    }
    if frame.len() < LENGTH_PREFIX {
        bail!("Truncated frame: {} bytes", frame.len());
    }

    let (prefix, body) = frame.split_at(LENGTH_PREFIX);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared != body.len() {
        bail!(
            "Frame length mismatch: declared {} bytes, got {}",
            declared,
            body.len()
        );
    }

    let msg: M = bincode::deserialize(body)?;
    if msg.message().len() > MAX_PAYLOAD_SIZE {
        bail!("Payload too large: {} bytes", msg.message().len());
    }
    Ok(msg)
}

/// The bytes a signature covers: the message encoded with an empty signature
pub fn signing_bytes<M: Signed + Clone>(msg: &M) -> bincode::Result<Vec<u8>> {
    let mut unsigned = msg.clone();
    unsigned.message_data_mut().signature.clear();
    bincode::serialize(&unsigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::{EchoRequest, MessageData, PingRequest};

    fn echo(text: &str) -> EchoRequest {
        EchoRequest {
            message_data: MessageData {
                message_id: "id-1".into(),
                signature: vec![9u8; 64],
                ..Default::default()
            },
            message: text.into(),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = echo("hello world");
        let frame = encode_frame(&msg).unwrap();
        let restored: EchoRequest = decode_frame(&frame).unwrap();
        assert_eq!(msg, restored);
    }

    #[test]
    fn test_reject_oversized_payload() {
        let msg = echo(&"x".repeat(MAX_PAYLOAD_SIZE + 1));
        assert!(encode_frame(&msg).is_err());
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(decode_frame::<EchoRequest>(&big).is_err());
    }

    #[test]
    fn test_reject_truncated_and_mismatched_frames() {
        assert!(decode_frame::<EchoRequest>(&[0, 0]).is_err());

        let mut frame = encode_frame(&echo("abc")).unwrap();
        frame.pop();
        assert!(decode_frame::<EchoRequest>(&frame).is_err());
    }

    #[test]
    fn test_frames_are_untyped_and_garbage_fails() {
        let frame = encode_frame(&echo("abc")).unwrap();
        // same layout, different type: still decodes, the protocol name is what separates them
        let as_ping: PingRequest = decode_frame(&frame).unwrap();
        assert_eq!(as_ping.message, "abc");

        assert!(decode_frame::<EchoRequest>(&[0, 0, 0, 2, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let a = echo("same");
        let mut b = a.clone();
        b.message_data.signature = vec![1, 2, 3];
        assert_eq!(signing_bytes(&a).unwrap(), signing_bytes(&b).unwrap());

        let mut c = a.clone();
        c.message = "other".into();
        assert_ne!(signing_bytes(&a).unwrap(), signing_bytes(&c).unwrap());
    }
}
