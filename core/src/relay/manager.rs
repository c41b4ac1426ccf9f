//! Relay Connectivity Manager: reaches peers that cannot be dialed directly
//!
//! The sequence is deliberately one-shot. Each step either succeeds or
//! aborts the whole call, and nothing is retried here; the driver decides
//! when to try again.

use super::circuit_address;
use crate::transport::{
    OpenStreamOptions, PeerStream, RelayPeer, Reservation, Transport, TransportError,
};
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use thiserror::Error;

/// Relay negotiation failures, one per step that can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Relay {relay} unreachable: {source}")]
    RelayUnreachable {
        relay: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("Relay {relay} denied the reservation: {source}")]
    ReservationDenied {
        relay: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("Circuit dial to {target} failed: {source}")]
    CircuitDialFailed {
        target: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("Opening a stream to {target} over the circuit failed: {source}")]
    StreamOpenFailed {
        target: PeerId,
        #[source]
        source: TransportError,
    },
}

impl RelayError {
    /// The step of the connection sequence that failed (1-based)
    pub fn step(&self) -> u8 {
        match self {
            RelayError::RelayUnreachable { .. } => 1,
            RelayError::ReservationDenied { .. } => 2,
            RelayError::CircuitDialFailed { .. } => 5,
            RelayError::StreamOpenFailed { .. } => 6,
        }
    }
}

pub struct RelayConnectivityManager<T: Transport> {
    transport: Arc<T>,
    relay: RelayPeer,
}

impl<T: Transport> RelayConnectivityManager<T> {
    pub fn new(transport: Arc<T>, relay: RelayPeer) -> Self {
        Self { transport, relay }
    }

    pub fn relay(&self) -> &RelayPeer {
        &self.relay
    }

    /// Steps 1-2: connect to the relay and hold a reservation on it
    pub async fn reserve(&self) -> Result<Reservation, RelayError> {
        let relay = self.relay.peer_id;

        self.transport
            .connect(relay, vec![self.relay.full_address()])
            .await
            .map_err(|source| RelayError::RelayUnreachable { relay, source })?;
        tracing::debug!(relay = %relay, "Connected to relay");

        let reservation = self
            .transport
            .reserve_relay_slot(self.relay.clone())
            .await
            .map_err(|source| RelayError::ReservationDenied { relay, source })?;
        tracing::info!(
            relay = %relay,
            addrs = reservation.addrs.len(),
            "Relay reservation held"
        );

        Ok(reservation)
    }

    /// Open a stream to `target` on `protocol` through the relay.
    ///
    /// 1. connect to the relay
    /// 2. reserve a slot on it
    /// 3. build `<relay-addr>/p2p-circuit/p2p/<target>`
    /// 4. clear the transport's dial backoff for `target`
    /// 5. connect to `target` with the circuit as its only address
    /// 6. open the stream, allowing a limited connection
    pub async fn connect_by_relay(
        &self,
        target: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream, RelayError> {
        tracing::info!(target = %target, relay = %self.relay.peer_id, "Connecting through relay");

        self.reserve().await?;

        let circuit = circuit_address(&self.relay, target);
        tracing::debug!(target = %target, %circuit, "Dialing circuit");

        // A failed direct dial would otherwise block the circuit dial
        self.transport.clear_dial_backoff(target).await;

        self.transport
            .connect(target, vec![circuit])
            .await
            .map_err(|source| RelayError::CircuitDialFailed { target, source })?;

        let stream = self
            .transport
            .open_stream(target, protocol, OpenStreamOptions::allow_limited())
            .await
            .map_err(|source| RelayError::StreamOpenFailed { target, source })?;

        tracing::info!(target = %target, "Stream open through relay");
        Ok(stream)
    }
}
