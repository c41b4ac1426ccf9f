// Message types: signed envelope plus the Ping/Echo payloads

use serde::{Deserialize, Serialize};

/// Metadata attached to every request and response.
///
/// `signature` covers the whole enclosing message encoded with this field
/// left empty, so it is never part of its own input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    /// Informational client version string
    pub client_version: String,
    /// Sender peer id (base58)
    pub node_id: String,
    /// Sender public key, protobuf-encoded
    pub node_public_key: Vec<u8>,
    /// Unix timestamp (seconds) at creation
    pub timestamp: i64,
    /// Correlates a response with its request (UUID v4)
    pub message_id: String,
    /// Reserved for fan-out; unused by Ping and Echo
    pub gossip: bool,
    /// Signature bytes, empty while signing
    pub signature: Vec<u8>,
}

/// A message that carries a `MessageData` envelope
pub trait Signed: Serialize {
    fn message_data(&self) -> &MessageData;
    fn message_data_mut(&mut self) -> &mut MessageData;
    /// Application text carried next to the envelope
    fn message(&self) -> &str;
}

macro_rules! signed_message {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub message_data: MessageData,
            pub message: String,
        }

        impl Signed for $name {
            fn message_data(&self) -> &MessageData {
                &self.message_data
            }

            fn message_data_mut(&mut self) -> &mut MessageData {
                &mut self.message_data
            }

            fn message(&self) -> &str {
                &self.message
            }
        }
    };
}

signed_message!(
    /// Fire-and-forget reachability probe
    PingRequest
);
signed_message!(PingResponse);
signed_message!(
    /// Request whose `message` is returned verbatim by the remote
    EchoRequest
);
signed_message!(EchoResponse);
