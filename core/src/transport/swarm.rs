// libp2p swarm setup: the actual running network node
//
// This creates and manages the libp2p Swarm with:
// - TCP transport, noise encryption, yamux multiplexing
// - circuit relay v2 client transport
// - all behaviours from behaviour.rs
//
// The swarm lives in its own task. `SwarmHandle` talks to it over a command
// channel and implements `Transport` on top of it.

use super::abstraction::{
    IncomingStreams, OpenStreamOptions, PeerStream, RelayPeer, Reservation, Transport,
    TransportError,
};
use super::backoff::DialBackoff;
use super::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use super::DEFAULT_RESERVATION_TTL;
use crate::identity::IdentityKeys;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::{transport::ListenerId, ConnectedPoint},
    identify, kad,
    multiaddr::Protocol,
    relay,
    swarm::{dial_opts::DialOpts, ConnectionId, DialError, SwarmEvent},
    Multiaddr, PeerId, StreamProtocol, Swarm,
};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

/// Swarm construction options
#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub listen_addrs: Vec<Multiaddr>,
    /// Also serve as a circuit relay for other peers
    pub relay_server: bool,
    pub idle_connection_timeout: Duration,
    /// Upper bound on a single dial or reservation request
    pub request_timeout: Duration,
    /// Lifetime recorded for granted reservations
    pub reservation_ttl: Duration,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            relay_server: false,
            idle_connection_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }
}

/// Number of open connections to a peer, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub direct: usize,
    pub relayed: usize,
}

impl ConnectionSummary {
    pub fn is_connected(&self) -> bool {
        self.direct + self.relayed > 0
    }

    /// Only relayed connections are open
    pub fn is_limited(&self) -> bool {
        self.direct == 0 && self.relayed > 0
    }
}

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a peer, completing once a connection is established or fails
    Connect {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: mpsc::Sender<Result<(), TransportError>>,
    },
    /// Forget recorded dial failures for a peer
    ClearBackoff { peer_id: PeerId },
    /// Request a relay reservation by listening on the relay's circuit address
    Reserve {
        relay: RelayPeer,
        reply: mpsc::Sender<Result<Reservation, TransportError>>,
    },
    /// Count open connections to a peer
    Connections {
        peer_id: PeerId,
        reply: mpsc::Sender<ConnectionSummary>,
    },
    /// Shutdown the swarm
    Shutdown,
}

/// Events emitted by the swarm to the application layer
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// We started listening on an address
    ListeningOn(Multiaddr),
    PeerConnected { peer_id: PeerId, relayed: bool },
    PeerDisconnected(PeerId),
    /// A relay granted (or renewed) our reservation
    ReservationAccepted { relay_peer_id: PeerId, renewal: bool },
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    command_tx: mpsc::Sender<SwarmCommand>,
    control: libp2p_stream::Control,
    request_timeout: Duration,
}

impl SwarmHandle {
    async fn request<R>(
        &self,
        command: impl FnOnce(mpsc::Sender<R>) -> SwarmCommand,
    ) -> Result<R, TransportError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| TransportError::NotRunning)?;

        reply_rx.recv().await.ok_or(TransportError::NotRunning)
    }

    /// Count open connections to a peer
    pub async fn connections(&self, peer_id: PeerId) -> Result<ConnectionSummary, TransportError> {
        self.request(|reply| SwarmCommand::Connections { peer_id, reply })
            .await
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }
}

#[async_trait]
impl Transport for SwarmHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams, TransportError> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| TransportError::AlreadyRegistered(protocol.to_string()))?;

        Ok(incoming
            .map(move |(peer, stream)| PeerStream::new(peer, protocol.clone(), stream))
            .boxed())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        options: OpenStreamOptions,
    ) -> Result<PeerStream, TransportError> {
        let mut summary = self.connections(peer).await?;
        if !summary.is_connected() {
            self.connect(peer, Vec::new()).await?;
            summary = self.connections(peer).await?;
        }
        if summary.is_limited() && !options.allow_limited {
            return Err(TransportError::LimitedConnection(peer));
        }

        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, protocol.clone())
            .await
            .map_err(|e| match e {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(p) => {
                    TransportError::UnsupportedProtocol {
                        peer,
                        protocol: p.to_string(),
                    }
                }
                other => TransportError::StreamOpen(other.to_string()),
            })?;

        Ok(PeerStream::new(peer, protocol, stream))
    }

    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), TransportError> {
        let pending = self.request(|reply| SwarmCommand::Connect {
            peer_id: peer,
            addrs,
            reply,
        });
        match tokio::time::timeout(self.request_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => Err(TransportError::DialFailed {
                peer,
                reason: "dial timed out".into(),
            }),
        }
    }

    async fn clear_dial_backoff(&self, peer: PeerId) {
        let _ = self
            .command_tx
            .send(SwarmCommand::ClearBackoff { peer_id: peer })
            .await;
    }

    async fn reserve_relay_slot(&self, relay: RelayPeer) -> Result<Reservation, TransportError> {
        let pending = self.request(|reply| SwarmCommand::Reserve { relay, reply });
        match tokio::time::timeout(self.request_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => Err(TransportError::ReservationDenied(
                "reservation request timed out".into(),
            )),
        }
    }
}

struct PendingReservation {
    relay: RelayPeer,
    reply: mpsc::Sender<Result<Reservation, TransportError>>,
}

struct ActiveReservation {
    listener_id: ListenerId,
    reservation: Reservation,
}

/// State owned by the swarm task
struct EventLoop {
    swarm: Swarm<NodeBehaviour>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::Sender<NetworkEvent>,
    /// Serving as a relay: listen addresses are advertised as external
    relay_server: bool,
    reservation_ttl: Duration,
    backoff: DialBackoff,
    /// Dials we started, by connection id
    dials: HashMap<ConnectionId, PeerId>,
    /// Callers waiting for a connection to a peer
    dial_waiters: HashMap<PeerId, Vec<mpsc::Sender<Result<(), TransportError>>>>,
    pending_reservations: HashMap<ListenerId, PendingReservation>,
    reservations: HashMap<PeerId, ActiveReservation>,
    /// Open connections per peer; the flag marks relayed ones
    connections: HashMap<PeerId, HashMap<ConnectionId, bool>>,
}

fn is_circuit(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

fn is_relayed(endpoint: &ConnectedPoint) -> bool {
    match endpoint {
        ConnectedPoint::Dialer { address, .. } => is_circuit(address),
        ConnectedPoint::Listener { local_addr, .. } => is_circuit(local_addr),
    }
}

fn is_circuit_via(addr: &Multiaddr, relay: PeerId) -> bool {
    let mut protocols = addr.iter().peekable();
    while let Some(p) = protocols.next() {
        if p == Protocol::P2p(relay) && protocols.peek() == Some(&Protocol::P2pCircuit) {
            return true;
        }
    }
    false
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event).await,
                command = self.command_rx.recv() => match command {
                    Some(SwarmCommand::Shutdown) | None => {
                        tracing::info!("Swarm shutting down");
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
            }
        }
    }

    async fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Connect {
                peer_id,
                addrs,
                reply,
            } => self.connect(peer_id, addrs, reply).await,

            SwarmCommand::ClearBackoff { peer_id } => {
                tracing::debug!(peer = %peer_id, "Clearing dial backoff");
                self.backoff.clear(&peer_id);
            }

            SwarmCommand::Reserve { relay, reply } => self.reserve(relay, reply).await,

            SwarmCommand::Connections { peer_id, reply } => {
                let mut summary = ConnectionSummary::default();
                for relayed in self.connections.get(&peer_id).into_iter().flat_map(|c| c.values()) {
                    if *relayed {
                        summary.relayed += 1;
                    } else {
                        summary.direct += 1;
                    }
                }
                let _ = reply.send(summary).await;
            }

            SwarmCommand::Shutdown => {}
        }
    }

    async fn connect(
        &mut self,
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: mpsc::Sender<Result<(), TransportError>>,
    ) {
        for addr in addrs.iter().filter(|a| !is_circuit(a)) {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }

        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(())).await;
            return;
        }

        let now = Instant::now();
        self.backoff.prune(now);
        if self.backoff.is_backed_off(&peer_id, now) {
            let _ = reply.send(Err(TransportError::DialBackoff(peer_id))).await;
            return;
        }

        let opts = DialOpts::peer_id(peer_id).addresses(addrs).build();
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.dials.insert(connection_id, peer_id);
                self.dial_waiters.entry(peer_id).or_default().push(reply);
            }
            Err(DialError::DialPeerConditionFalse(_)) => {
                // a dial to this peer is already in flight; wait for its outcome
                self.dial_waiters.entry(peer_id).or_default().push(reply);
            }
            Err(e) => {
                tracing::debug!(peer = %peer_id, error = %e, "Dial rejected");
                self.backoff.record_failure(peer_id, now);
                let _ = reply
                    .send(Err(TransportError::DialFailed {
                        peer: peer_id,
                        reason: e.to_string(),
                    }))
                    .await;
            }
        }
    }

    async fn reserve(
        &mut self,
        relay: RelayPeer,
        reply: mpsc::Sender<Result<Reservation, TransportError>>,
    ) {
        // the relay client renews live reservations on its own
        if let Some(active) = self.reservations.get(&relay.peer_id) {
            let _ = reply.send(Ok(active.reservation.clone())).await;
            return;
        }

        let circuit = relay.full_address().with(Protocol::P2pCircuit);
        match self.swarm.listen_on(circuit) {
            Ok(listener_id) => {
                self.pending_reservations
                    .insert(listener_id, PendingReservation { relay, reply });
            }
            Err(e) => {
                let _ = reply
                    .send(Err(TransportError::ReservationDenied(e.to_string())))
                    .await;
            }
        }
    }

    async fn fail_reservation(&mut self, listener_id: ListenerId, reason: String) {
        if let Some(pending) = self.pending_reservations.remove(&listener_id) {
            tracing::warn!(relay = %pending.relay.peer_id, %reason, "Relay reservation failed");
            let _ = pending
                .reply
                .send(Err(TransportError::ReservationDenied(reason)))
                .await;
        }
        self.reservations
            .retain(|_, active| active.listener_id != listener_id);
    }

    async fn reservation_accepted(&mut self, relay_peer_id: PeerId, renewal: bool) {
        let expiration = SystemTime::now() + self.reservation_ttl;
        let local = *self.swarm.local_peer_id();

        let listener_id = self
            .pending_reservations
            .iter()
            .find(|(_, p)| p.relay.peer_id == relay_peer_id)
            .map(|(id, _)| *id);

        if let Some(listener_id) = listener_id {
            if let Some(pending) = self.pending_reservations.remove(&listener_id) {
                let mut addrs: Vec<Multiaddr> = self
                    .swarm
                    .listeners()
                    .filter(|a| is_circuit_via(a, relay_peer_id))
                    .cloned()
                    .collect();
                if addrs.is_empty() {
                    addrs.push(
                        pending
                            .relay
                            .full_address()
                            .with(Protocol::P2pCircuit)
                            .with(Protocol::P2p(local)),
                    );
                }
                let reservation = Reservation {
                    relay_peer_id,
                    expiration,
                    addrs,
                };
                self.reservations.insert(
                    relay_peer_id,
                    ActiveReservation {
                        listener_id,
                        reservation: reservation.clone(),
                    },
                );
                let _ = pending.reply.send(Ok(reservation)).await;
            }
        } else if let Some(active) = self.reservations.get_mut(&relay_peer_id) {
            active.reservation.expiration = expiration;
        }

        tracing::info!(relay = %relay_peer_id, renewal, "Relay reservation accepted");
        let _ = self
            .event_tx
            .send(NetworkEvent::ReservationAccepted {
                relay_peer_id,
                renewal,
            })
            .await;
    }

    async fn resolve_dial(&mut self, peer_id: PeerId, result: Result<(), TransportError>) {
        self.dials.retain(|_, p| *p != peer_id);
        for waiter in self.dial_waiters.remove(&peer_id).unwrap_or_default() {
            let _ = waiter.send(result.clone()).await;
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted {
                    relay_peer_id,
                    renewal,
                    ..
                },
            )) => self.reservation_accepted(relay_peer_id, renewal).await,

            SwarmEvent::Behaviour(NodeBehaviourEvent::RelayClient(event)) => {
                tracing::debug!(?event, "Relay client event");
            }

            SwarmEvent::Behaviour(NodeBehaviourEvent::RelayServer(event)) => {
                tracing::debug!(?event, "Relay server event");
            }

            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                tracing::debug!(
                    peer = %peer_id,
                    addrs = info.listen_addrs.len(),
                    "Identified peer"
                );
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                ..
            })) => {
                tracing::debug!(peer = %peer, "Kademlia routing updated");
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {}", address);
                // a relay server hands out reservations only with external addresses
                if self.relay_server && !is_circuit(&address) {
                    self.swarm.add_external_address(address.clone());
                }
                let _ = self
                    .event_tx
                    .send(NetworkEvent::ListeningOn(address))
                    .await;
            }

            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                self.fail_reservation(listener_id, reason).await;
            }

            SwarmEvent::ListenerError { listener_id, error } => {
                self.fail_reservation(listener_id, error.to_string()).await;
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let relayed = is_relayed(&endpoint);
                tracing::info!(
                    peer = %peer_id,
                    relayed,
                    "Connected via {}",
                    endpoint.get_remote_address()
                );
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, relayed);
                self.backoff.clear(&peer_id);
                self.resolve_dial(peer_id, Ok(())).await;
                let _ = self
                    .event_tx
                    .send(NetworkEvent::PeerConnected { peer_id, relayed })
                    .await;
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                        tracing::info!(peer = %peer_id, "Disconnected");
                        let _ = self
                            .event_tx
                            .send(NetworkEvent::PeerDisconnected(peer_id))
                            .await;
                    }
                }
            }

            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                tracing::debug!(?peer_id, %error, "Outgoing connection failed");
                let ours = self.dials.remove(&connection_id);
                if let Some(peer_id) = peer_id.or(ours) {
                    self.backoff.record_failure(peer_id, Instant::now());
                    let still_dialing = self.dials.values().any(|p| *p == peer_id);
                    if ours.is_some() && !still_dialing && !self.swarm.is_connected(&peer_id) {
                        self.resolve_dial(
                            peer_id,
                            Err(TransportError::DialFailed {
                                peer: peer_id,
                                reason: error.to_string(),
                            }),
                        )
                        .await;
                    }
                }
            }

            _ => {}
        }
    }
}

/// Build and start the libp2p swarm, returning a handle for communication.
///
/// This spawns a tokio task that runs the swarm event loop.
pub async fn start_swarm(
    keys: &IdentityKeys,
    options: SwarmOptions,
    event_tx: mpsc::Sender<NetworkEvent>,
) -> Result<SwarmHandle> {
    let relay_server = options.relay_server;
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keys.keypair().clone())
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_relay_client(libp2p::noise::Config::new, libp2p::yamux::Config::default)?
        .with_behaviour(|key, relay_client| NodeBehaviour::new(key, relay_client, relay_server))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(options.idle_connection_timeout))
        .build();

    for addr in &options.listen_addrs {
        swarm.listen_on(addr.clone())?;
    }

    // Server mode so peers can use us as a routing entry
    swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let control = swarm.behaviour().streams.new_control();
    let (command_tx, command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle {
        local_peer_id: keys.peer_id(),
        command_tx,
        control,
        request_timeout: options.request_timeout,
    };

    let event_loop = EventLoop {
        swarm,
        command_rx,
        event_tx,
        relay_server,
        reservation_ttl: options.reservation_ttl,
        backoff: DialBackoff::new(),
        dials: HashMap::new(),
        dial_waiters: HashMap::new(),
        pending_reservations: HashMap::new(),
        reservations: HashMap::new(),
        connections: HashMap::new(),
    };
    tokio::spawn(event_loop.run());

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_summary() {
        let none = ConnectionSummary::default();
        assert!(!none.is_connected());
        assert!(!none.is_limited());

        let relayed = ConnectionSummary {
            direct: 0,
            relayed: 1,
        };
        assert!(relayed.is_connected());
        assert!(relayed.is_limited());

        let mixed = ConnectionSummary {
            direct: 1,
            relayed: 1,
        };
        assert!(!mixed.is_limited());
    }

    #[test]
    fn test_is_circuit_via() {
        let relay = PeerId::random();
        let other = PeerId::random();
        let me = PeerId::random();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{relay}/p2p-circuit/p2p/{me}")
            .parse()
            .unwrap();
        assert!(is_circuit_via(&addr, relay));
        assert!(!is_circuit_via(&addr, other));

        let direct: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{relay}").parse().unwrap();
        assert!(!is_circuit_via(&direct, relay));
    }

    #[test]
    fn test_circuit_addresses_are_not_advertised() {
        let relay = PeerId::random();
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let circuit = tcp
            .clone()
            .with(Protocol::P2p(relay))
            .with(Protocol::P2pCircuit);
        assert!(!is_circuit(&tcp));
        assert!(is_circuit(&circuit));
    }

    #[test]
    fn test_is_relayed_endpoint() {
        let relay = PeerId::random();
        let circuit: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{relay}/p2p-circuit")
            .parse()
            .unwrap();
        let dialer = ConnectedPoint::Dialer {
            address: circuit,
            role_override: libp2p::core::Endpoint::Dialer,
        };
        assert!(is_relayed(&dialer));

        let listener = ConnectedPoint::Listener {
            local_addr: "/ip4/0.0.0.0/tcp/1".parse().unwrap(),
            send_back_addr: "/ip4/5.6.7.8/tcp/2".parse().unwrap(),
        };
        assert!(!is_relayed(&listener));
    }

    #[tokio::test]
    async fn test_swarm_starts_and_reports_no_connections() {
        let keys = IdentityKeys::generate();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let options = SwarmOptions {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            ..Default::default()
        };
        let handle = start_swarm(&keys, options, event_tx).await.unwrap();

        assert_eq!(handle.local_peer_id(), keys.peer_id());
        let summary = handle.connections(PeerId::random()).await.unwrap();
        assert!(!summary.is_connected());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_twice_is_rejected() {
        let keys = IdentityKeys::generate();
        let (event_tx, _event_rx) = mpsc::channel(16);
        let handle = start_swarm(&keys, SwarmOptions::default(), event_tx)
            .await
            .unwrap();

        let proto = StreamProtocol::new("/multipro/test/1");
        let _incoming = handle.accept(proto.clone()).unwrap();
        assert!(matches!(
            handle.accept(proto),
            Err(TransportError::AlreadyRegistered(_))
        ));
    }
}
