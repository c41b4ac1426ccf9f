// Ping: fire-and-forget reachability probe

use super::{
    evict_pending, handle_response, read_message, ExchangeOutcome, PendingRequests,
    ProtocolHandler, ProtocolKind, PING_REQUEST, PING_RESPONSE,
};
use crate::message::{encode_frame, PingRequest, PingResponse};
use crate::node::NodeContext;
use crate::transport::{OpenStreamOptions, PeerStream, Transport};
use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct PingProtocol<T: Transport> {
    ctx: Arc<NodeContext<T>>,
    pending: PendingRequests<PingRequest>,
}

impl<T: Transport> PingProtocol<T> {
    pub fn new(ctx: Arc<NodeContext<T>>) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
        }
    }

    pub fn pending(&self) -> &PendingRequests<PingRequest> {
        &self.pending
    }

    /// Send a signed ping to `peer` over a direct connection.
    ///
    /// Returns false if signing, dialing or writing fails. The pending
    /// entry is kept either way; the sweeper evicts it.
    pub async fn ping(&self, peer: PeerId) -> bool {
        let local = self.ctx.peer_id();
        tracing::info!(peer = %peer, "Sending ping");

        let mut request = PingRequest {
            message_data: self.ctx.new_request_data(),
            message: format!("Ping from {}", local),
        };
        if let Err(e) = self.ctx.sign(&mut request) {
            tracing::warn!(error = %e, "Failed to sign ping");
            return false;
        }
        let frame = match encode_frame(&request) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode ping");
                return false;
            }
        };

        let message_id = request.message_data.message_id.clone();
        self.pending.insert(message_id.clone(), peer, request);

        match self
            .ctx
            .send_frame(peer, self.request_protocol(), &frame, OpenStreamOptions::direct())
            .await
        {
            Ok(()) => {
                tracing::info!(peer = %peer, message_id = %message_id, "Ping sent");
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Ping failed");
                false
            }
        }
    }
}

#[async_trait]
impl<T: Transport> ProtocolHandler for PingProtocol<T> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ping
    }

    fn request_protocol(&self) -> StreamProtocol {
        StreamProtocol::new(PING_REQUEST)
    }

    fn response_protocol(&self) -> StreamProtocol {
        StreamProtocol::new(PING_RESPONSE)
    }

    async fn on_request(&self, stream: PeerStream) {
        let peer = stream.remote_peer();
        let request: PingRequest = match read_message(stream).await {
            Ok(request) => request,
            Err(reason) => {
                tracing::warn!(peer = %peer, %reason, "Unreadable ping request");
                self.ctx
                    .publish(self.kind(), peer, String::new(), ExchangeOutcome::Dropped { reason });
                return;
            }
        };

        let message_id = request.message_data.message_id.clone();
        if !self.ctx.authenticate(&request) {
            self.ctx.publish(
                self.kind(),
                peer,
                message_id,
                ExchangeOutcome::Dropped {
                    reason: "authentication failed".into(),
                },
            );
            return;
        }

        // Probe only; the stream is already closed and no response follows
        tracing::info!(
            peer = %peer,
            message_id = %message_id,
            "Received ping: {}",
            request.message
        );
        self.ctx
            .publish(self.kind(), peer, message_id, ExchangeOutcome::RequestReceived);
    }

    async fn on_response(&self, stream: PeerStream) {
        handle_response::<T, PingResponse, _>(&self.ctx, self.kind(), &self.pending, stream).await;
    }

    fn evict_expired(&self, timeout: Duration, now: Instant) -> usize {
        evict_pending(&self.ctx, self.kind(), &self.pending, timeout, now)
    }
}
