// Echo: the remote returns our message verbatim on the response protocol

use super::{
    evict_pending, handle_response, read_message, ExchangeOutcome, PendingRequests,
    ProtocolHandler, ProtocolKind, ECHO_REQUEST, ECHO_RESPONSE,
};
use crate::message::{encode_frame, EchoRequest, EchoResponse};
use crate::node::NodeContext;
use crate::transport::{OpenStreamOptions, PeerStream, Transport};
use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct EchoProtocol<T: Transport> {
    ctx: Arc<NodeContext<T>>,
    pending: PendingRequests<EchoRequest>,
}

impl<T: Transport> EchoProtocol<T> {
    pub fn new(ctx: Arc<NodeContext<T>>) -> Self {
        Self {
            ctx,
            pending: PendingRequests::new(),
        }
    }

    pub fn pending(&self) -> &PendingRequests<EchoRequest> {
        &self.pending
    }

    fn default_text(&self) -> String {
        format!("Echo from {}", self.ctx.peer_id())
    }

    /// Signed request plus its wire frame
    fn build_request(&self, text: String) -> Option<(EchoRequest, Vec<u8>)> {
        let mut request = EchoRequest {
            message_data: self.ctx.new_request_data(),
            message: text,
        };
        if let Err(e) = self.ctx.sign(&mut request) {
            tracing::warn!(error = %e, "Failed to sign echo request");
            return None;
        }
        match encode_frame(&request) {
            Ok(frame) => Some((request, frame)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode echo request");
                None
            }
        }
    }

    /// Echo the default greeting to `peer` over a direct connection
    pub async fn echo(&self, peer: PeerId) -> bool {
        self.echo_with(peer, self.default_text()).await
    }

    /// Echo `text` to `peer` over a direct connection
    pub async fn echo_with(&self, peer: PeerId, text: impl Into<String>) -> bool {
        let Some((request, frame)) = self.build_request(text.into()) else {
            return false;
        };
        let message_id = request.message_data.message_id.clone();
        self.pending.insert(message_id.clone(), peer, request);

        match self
            .ctx
            .send_frame(peer, self.request_protocol(), &frame, OpenStreamOptions::direct())
            .await
        {
            Ok(()) => {
                tracing::info!(peer = %peer, message_id = %message_id, "Echo sent");
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Echo failed");
                false
            }
        }
    }

    /// Send an echo request over a stream that is already open on the
    /// request protocol, such as one opened through a relay circuit
    pub async fn echo_on_stream(&self, stream: PeerStream, text: impl Into<String>) -> bool {
        let peer = stream.remote_peer();
        let Some((request, frame)) = self.build_request(text.into()) else {
            stream.reset();
            return false;
        };
        let message_id = request.message_data.message_id.clone();
        self.pending.insert(message_id.clone(), peer, request);

        match self.ctx.write_frame(stream, &frame).await {
            Ok(()) => {
                tracing::info!(peer = %peer, message_id = %message_id, "Echo sent on open stream");
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Echo on open stream failed");
                false
            }
        }
    }

    /// Echo the default greeting over an already open stream
    pub async fn echo_default_on_stream(&self, stream: PeerStream) -> bool {
        let text = self.default_text();
        self.echo_on_stream(stream, text).await
    }
}

#[async_trait]
impl<T: Transport> ProtocolHandler for EchoProtocol<T> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Echo
    }

    fn request_protocol(&self) -> StreamProtocol {
        StreamProtocol::new(ECHO_REQUEST)
    }

    fn response_protocol(&self) -> StreamProtocol {
        StreamProtocol::new(ECHO_RESPONSE)
    }

    async fn on_request(&self, stream: PeerStream) {
        let peer = stream.remote_peer();
        let request: EchoRequest = match read_message(stream).await {
            Ok(request) => request,
            Err(reason) => {
                tracing::warn!(peer = %peer, %reason, "Unreadable echo request");
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

        tracing::info!(
            peer = %peer,
            message_id = %message_id,
            "Received echo request: {}",
            request.message
        );
        self.ctx
            .publish(self.kind(), peer, message_id.clone(), ExchangeOutcome::RequestReceived);

        let mut response = EchoResponse {
            message_data: self.ctx.new_message_data(message_id.clone(), false),
            message: request.message,
        };
        if let Err(e) = self.ctx.sign(&mut response) {
            tracing::warn!(error = %e, "Failed to sign echo response");
            return;
        }
        let frame = match encode_frame(&response) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode echo response");
                return;
            }
        };

        // The requester may only be reachable over the circuit it came in on
        match self
            .ctx
            .send_frame(
                peer,
                self.response_protocol(),
                &frame,
                OpenStreamOptions::allow_limited(),
            )
            .await
        {
            Ok(()) => tracing::info!(peer = %peer, message_id = %message_id, "Echo response sent"),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Echo response failed"),
        }
    }

    async fn on_response(&self, stream: PeerStream) {
        handle_response::<T, EchoResponse, _>(&self.ctx, self.kind(), &self.pending, stream).await;
    }

    fn evict_expired(&self, timeout: Duration, now: Instant) -> usize {
        evict_pending(&self.ctx, self.kind(), &self.pending, timeout, now)
    }
}
