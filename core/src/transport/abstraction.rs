//! Transport abstraction layer
//!
//! The boundary between the messaging core and the peer-to-peer network
//! underneath it. Everything the protocol handlers and the relay manager
//! need from the network goes through [`Transport`].

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::stream::BoxStream;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },
    #[error("Peer {0} is in dial backoff")]
    DialBackoff(PeerId),
    #[error("Peer {0} is only reachable over a limited (relayed) connection")]
    LimitedConnection(PeerId),
    #[error("Peer {peer} does not support {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: String },
    #[error("Failed to open stream: {0}")]
    StreamOpen(String),
    #[error("Handler already registered for {0}")]
    AlreadyRegistered(String),
    #[error("Relay reservation denied: {0}")]
    ReservationDenied(String),
    #[error("Message too large: more than {0} bytes")]
    MessageTooLarge(usize),
    #[error("Stream I/O error: {0}")]
    Io(String),
    #[error("Transport is not running")]
    NotRunning,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// How a dial is allowed to reach the peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenStreamOptions {
    /// Accept a bandwidth-limited relayed connection. Off by default, so
    /// ordinary dials never silently go through someone else's relay.
    pub allow_limited: bool,
}

impl OpenStreamOptions {
    pub fn direct() -> Self {
        Self {
            allow_limited: false,
        }
    }

    pub fn allow_limited() -> Self {
        Self {
            allow_limited: true,
        }
    }
}

/// A relay peer and the address it is dialed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPeer {
    pub peer_id: PeerId,
    pub address: Multiaddr,
}

impl RelayPeer {
    /// Parse `/.../p2p/<relay-id>`; the peer id component is required
    pub fn from_multiaddr(address: Multiaddr) -> Option<Self> {
        let peer_id = address.iter().find_map(|p| match p {
            Protocol::P2p(id) => Some(id),
            _ => None,
        })?;
        Some(Self { peer_id, address })
    }

    /// The relay address, always ending in `/p2p/<relay-id>`
    pub fn full_address(&self) -> Multiaddr {
        match self.address.iter().last() {
            Some(Protocol::P2p(id)) if id == self.peer_id => self.address.clone(),
            _ => self.address.clone().with(Protocol::P2p(self.peer_id)),
        }
    }
}

/// A relay's temporary commitment to forward traffic for us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub relay_peer_id: PeerId,
    pub expiration: SystemTime,
    /// Addresses the relay advertises for reaching us through it
    pub addrs: Vec<Multiaddr>,
}

/// Object-safe byte stream
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// A single sub-protocol stream to a remote peer
pub struct PeerStream {
    remote: PeerId,
    protocol: StreamProtocol,
    io: Box<dyn StreamIo>,
}

impl PeerStream {
    pub fn new(remote: PeerId, protocol: StreamProtocol, io: impl StreamIo + 'static) -> Self {
        Self {
            remote,
            protocol,
            io: Box::new(io),
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    /// Read until the remote closes its write side, refusing more than `limit` bytes
    pub async fn read_all(&mut self, limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        (&mut *self.io)
            .take(limit as u64 + 1)
            .read_to_end(&mut buf)
            .await?;
        if buf.len() > limit {
            return Err(TransportError::MessageTooLarge(limit));
        }
        Ok(buf)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Graceful close of our write side
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.io.close().await?;
        Ok(())
    }

    /// Abrupt close; the remote sees the stream end without a clean shutdown
    pub fn reset(self) {
        drop(self.io);
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Inbound streams for one registered sub-protocol
pub type IncomingStreams = BoxStream<'static, PeerStream>;

/// What the messaging core needs from the peer-to-peer network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Our own peer id
    fn local_peer_id(&self) -> PeerId;

    /// Register interest in a sub-protocol; every inbound stream for it is
    /// yielded by the returned stream
    fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams, TransportError>;

    /// Open a stream to `peer`, dialing it first if needed
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        options: OpenStreamOptions,
    ) -> Result<PeerStream, TransportError>;

    /// Connect to `peer`, using `addrs` in addition to anything already known
    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), TransportError>;

    /// Forget earlier dial failures so the next dial to `peer` is attempted
    async fn clear_dial_backoff(&self, peer: PeerId);

    /// Ask `relay` for a reservation slot for the local peer
    async fn reserve_relay_slot(&self, relay: RelayPeer) -> Result<Reservation, TransportError>;
}
