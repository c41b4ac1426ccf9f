//! Request/response sub-protocols
//!
//! Each protocol is a pair of stream protocols: requests arrive on one name
//! and responses come back on a fresh stream under the other. A response is
//! only accepted if it authenticates, its message id is still pending and it
//! comes from the peer the request was sent to.

pub mod echo;
pub mod pending;
pub mod ping;

pub use echo::EchoProtocol;
pub use pending::{PendingEntry, PendingRequests};
pub use ping::PingProtocol;

use crate::message::{decode_frame, Signed, MAX_MESSAGE_SIZE};
use crate::node::NodeContext;
use crate::transport::{PeerStream, Transport};
use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::{Duration, Instant};

pub const PING_REQUEST: &str = "/ping/pingreq/0.0.1";
pub const PING_RESPONSE: &str = "/ping/pingresp/0.0.1";
pub const ECHO_REQUEST: &str = "/echo/echoreq/0.0.1";
pub const ECHO_RESPONSE: &str = "/echo/echoresp/0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Ping,
    Echo,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Ping => write!(f, "ping"),
            ProtocolKind::Echo => write!(f, "echo"),
        }
    }
}

/// How an exchange ended, as seen by the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// An authenticated request from a remote peer was handled
    RequestReceived,
    /// Response authenticated and matched a pending request, which is now complete
    Matched { payload: String },
    /// Message was unreadable or failed authentication
    Dropped { reason: String },
    /// Authenticated response whose message id is not pending
    Unmatched,
    /// Pending request evicted after the request timeout
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEvent {
    pub protocol: ProtocolKind,
    pub peer: PeerId,
    pub message_id: String,
    pub outcome: ExchangeOutcome,
}

/// One request/response sub-protocol bound to a node
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn kind(&self) -> ProtocolKind;

    fn request_protocol(&self) -> StreamProtocol;

    fn response_protocol(&self) -> StreamProtocol;

    /// Handle one inbound request stream
    async fn on_request(&self, stream: PeerStream);

    /// Handle one inbound response stream
    async fn on_response(&self, stream: PeerStream);

    /// Evict pending requests older than `timeout`, returning how many went
    fn evict_expired(&self, timeout: Duration, now: Instant) -> usize;
}

/// Read a whole message off `stream`, then close it.
/// A failed read resets the stream instead.
pub(crate) async fn read_message<M: Signed + DeserializeOwned>(
    mut stream: PeerStream,
) -> Result<M, String> {
    let frame = match stream.read_all(MAX_MESSAGE_SIZE).await {
        Ok(frame) => frame,
        Err(e) => {
            stream.reset();
            return Err(e.to_string());
        }
    };
    if let Err(e) = stream.close().await {
        tracing::debug!(error = %e, "Closing inbound stream failed");
    }
    decode_frame(&frame).map_err(|e| e.to_string())
}

/// Shared response path: authenticate, then complete the matching pending request
pub(crate) async fn handle_response<T, M, R>(
    ctx: &NodeContext<T>,
    kind: ProtocolKind,
    pending: &PendingRequests<R>,
    stream: PeerStream,
) where
    T: Transport,
    M: Signed + DeserializeOwned + Clone,
{
    let peer = stream.remote_peer();
    let response: M = match read_message(stream).await {
        Ok(response) => response,
        Err(reason) => {
            tracing::warn!(protocol = %kind, peer = %peer, %reason, "Unreadable response");
            ctx.publish(kind, peer, String::new(), ExchangeOutcome::Dropped { reason });
            return;
        }
    };

    let message_id = response.message_data().message_id.clone();
    if !ctx.authenticate(&response) {
        ctx.publish(
            kind,
            peer,
            message_id,
            ExchangeOutcome::Dropped {
                reason: "authentication failed".into(),
            },
        );
        return;
    }

    // only the peer the request went to can complete it
    match pending.remove_from(&message_id, &peer) {
        Some(_) => {
            tracing::info!(
                protocol = %kind,
                peer = %peer,
                message_id = %message_id,
                "Received response: {}",
                response.message()
            );
            ctx.publish(
                kind,
                peer,
                message_id,
                ExchangeOutcome::Matched {
                    payload: response.message().to_string(),
                },
            );
        }
        None => {
            tracing::warn!(
                protocol = %kind,
                peer = %peer,
                message_id = %message_id,
                "Unmatched response, dropping"
            );
            ctx.publish(kind, peer, message_id, ExchangeOutcome::Unmatched);
        }
    }
}

/// Shared sweep: evict expired requests and report each as timed out
pub(crate) fn evict_pending<T: Transport, R>(
    ctx: &NodeContext<T>,
    kind: ProtocolKind,
    pending: &PendingRequests<R>,
    timeout: Duration,
    now: Instant,
) -> usize {
    let evicted = pending.evict_expired(timeout, now);
    for (message_id, entry) in &evicted {
        tracing::warn!(
            protocol = %kind,
            peer = %entry.peer,
            message_id = %message_id,
            "Request timed out"
        );
        ctx.publish(kind, entry.peer, message_id.clone(), ExchangeOutcome::TimedOut);
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_are_valid() {
        for name in [PING_REQUEST, PING_RESPONSE, ECHO_REQUEST, ECHO_RESPONSE] {
            assert!(name.starts_with('/'));
            let _ = StreamProtocol::new(name);
        }
        assert_ne!(PING_REQUEST, PING_RESPONSE);
        assert_ne!(ECHO_REQUEST, ECHO_RESPONSE);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ProtocolKind::Ping.to_string(), "ping");
        assert_eq!(ProtocolKind::Echo.to_string(), "echo");
    }
}
