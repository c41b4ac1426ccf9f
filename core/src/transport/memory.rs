//! In-process transport
//!
//! Several nodes in one process share a [`MemoryNetwork`]. It models which
//! peers accept direct dials, relays with an accept/deny reservation
//! policy, circuit connections through those relays, per-protocol stream
//! handlers and dial backoff. Streams are in-memory duplex pipes.

use super::abstraction::{
    IncomingStreams, OpenStreamOptions, PeerStream, RelayPeer, Reservation, Transport,
    TransportError,
};
use super::backoff::DialBackoff;
use super::DEFAULT_RESERVATION_TTL;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio_util::compat::TokioAsyncReadCompatExt;

const STREAM_BUFFER: usize = 64 * 1024;

/// Whether a relay hands out reservations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPolicy {
    Accept,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Relayed { relay: PeerId },
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<(PeerId, StreamProtocol), mpsc::UnboundedSender<PeerStream>>,
    dialable: HashSet<PeerId>,
    relays: HashMap<PeerId, RelayPolicy>,
    /// (relay, reserving peer)
    reservations: HashSet<(PeerId, PeerId)>,
    connections: HashMap<(PeerId, PeerId), ConnectionKind>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// The relay a `/p2p/<relay>/p2p-circuit/...` address routes through
fn circuit_relay(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::P2p(id) => last_peer = Some(id),
            Protocol::P2pCircuit => return last_peer,
            _ => {}
        }
    }
    None
}

impl NetworkState {
    fn dial(&mut self, local: PeerId, peer: PeerId, addrs: &[Multiaddr]) -> Result<(), TransportError> {
        let failed = |reason: &str| TransportError::DialFailed {
            peer,
            reason: reason.to_string(),
        };

        if let Some(relay) = addrs.iter().find_map(circuit_relay) {
            if !self.connections.contains_key(&link(local, relay)) {
                return Err(failed("not connected to the relay"));
            }
            if !self.reservations.contains(&(relay, peer)) {
                return Err(failed("target holds no reservation on the relay"));
            }
            self.connections
                .insert(link(local, peer), ConnectionKind::Relayed { relay });
            return Ok(());
        }

        if self.dialable.contains(&peer) || self.relays.contains_key(&peer) {
            self.connections
                .insert(link(local, peer), ConnectionKind::Direct);
            Ok(())
        } else {
            Err(failed("peer is not directly reachable"))
        }
    }
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a peer that accepts direct dials
    pub fn transport(&self, peer: PeerId) -> MemoryTransport {
        self.set_dialable(peer, true);
        self.attach(peer)
    }

    /// Transport for a peer that can dial out but cannot be dialed (NAT)
    pub fn transport_behind_nat(&self, peer: PeerId) -> MemoryTransport {
        self.set_dialable(peer, false);
        self.attach(peer)
    }

    fn attach(&self, peer: PeerId) -> MemoryTransport {
        MemoryTransport {
            local: peer,
            network: self.clone(),
            backoff: Mutex::new(DialBackoff::new()),
        }
    }

    pub fn set_dialable(&self, peer: PeerId, dialable: bool) {
        let mut state = self.state.lock();
        if dialable {
            state.dialable.insert(peer);
        } else {
            state.dialable.remove(&peer);
        }
    }

    /// Register a relay service
    pub fn add_relay(&self, relay: PeerId, policy: RelayPolicy) {
        self.state.lock().relays.insert(relay, policy);
    }

    pub fn connection(&self, a: PeerId, b: PeerId) -> Option<ConnectionKind> {
        self.state.lock().connections.get(&link(a, b)).copied()
    }

    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        self.state.lock().connections.remove(&link(a, b));
    }

    pub fn has_reservation(&self, relay: PeerId, peer: PeerId) -> bool {
        self.state.lock().reservations.contains(&(relay, peer))
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
    backoff: Mutex<DialBackoff>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn is_backed_off(&self, peer: &PeerId) -> bool {
        self.backoff.lock().is_backed_off(peer, Instant::now())
    }

    /// Hand the far end of a fresh pipe to the remote handler
    fn deliver(&self, peer: PeerId, protocol: StreamProtocol) -> Result<PeerStream, TransportError> {
        let state = self.network.state.lock();
        let handler = state
            .handlers
            .get(&(peer, protocol.clone()))
            .ok_or_else(|| TransportError::UnsupportedProtocol {
                peer,
                protocol: protocol.to_string(),
            })?;

        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        handler
            .unbounded_send(PeerStream::new(self.local, protocol.clone(), theirs.compat()))
            .map_err(|_| TransportError::StreamOpen("remote handler is gone".into()))?;
        Ok(PeerStream::new(peer, protocol, ours.compat()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams, TransportError> {
        let mut state = self.network.state.lock();
        let key = (self.local, protocol.clone());
        if let Some(existing) = state.handlers.get(&key) {
            if !existing.is_closed() {
                return Err(TransportError::AlreadyRegistered(protocol.to_string()));
            }
        }
        let (tx, rx) = mpsc::unbounded();
        state.handlers.insert(key, tx);
        Ok(rx.boxed())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        options: OpenStreamOptions,
    ) -> Result<PeerStream, TransportError> {
        let kind = match self.network.connection(self.local, peer) {
            Some(kind) => kind,
            None => {
                self.connect(peer, Vec::new()).await?;
                self.network
                    .connection(self.local, peer)
                    .ok_or_else(|| TransportError::StreamOpen("connection lost".into()))?
            }
        };

        if matches!(kind, ConnectionKind::Relayed { .. }) && !options.allow_limited {
            return Err(TransportError::LimitedConnection(peer));
        }

        self.deliver(peer, protocol)
    }

    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), TransportError> {
        if peer == self.local {
            return Err(TransportError::DialFailed {
                peer,
                reason: "cannot dial self".into(),
            });
        }
        if self.network.connection(self.local, peer).is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if self.backoff.lock().is_backed_off(&peer, now) {
            return Err(TransportError::DialBackoff(peer));
        }

        let result = self.network.state.lock().dial(self.local, peer, &addrs);
        match &result {
            Ok(()) => self.backoff.lock().clear(&peer),
            Err(_) => self.backoff.lock().record_failure(peer, now),
        }
        result
    }

    async fn clear_dial_backoff(&self, peer: PeerId) {
        self.backoff.lock().clear(&peer);
    }

    async fn reserve_relay_slot(&self, relay: RelayPeer) -> Result<Reservation, TransportError> {
        let mut state = self.network.state.lock();
        if !state.connections.contains_key(&link(self.local, relay.peer_id)) {
            return Err(TransportError::ReservationDenied(
                "not connected to the relay".into(),
            ));
        }
        match state.relays.get(&relay.peer_id) {
            Some(RelayPolicy::Accept) => {
                state.reservations.insert((relay.peer_id, self.local));
                Ok(Reservation {
                    relay_peer_id: relay.peer_id,
                    expiration: SystemTime::now() + DEFAULT_RESERVATION_TTL,
                    addrs: vec![relay
                        .full_address()
                        .with(Protocol::P2pCircuit)
                        .with(Protocol::P2p(self.local))],
                })
            }
            Some(RelayPolicy::Deny) => Err(TransportError::ReservationDenied(
                "relay refused the reservation".into(),
            )),
            None => Err(TransportError::ReservationDenied(
                "peer does not run a relay service".into(),
            )),
        }
    }
}
