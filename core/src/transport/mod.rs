// Transport module: the stream transport boundary and its implementations

pub mod abstraction;
pub mod backoff;
pub mod behaviour;
pub mod memory;
pub mod swarm;

use std::time::Duration;

/// Lifetime assumed for a granted relay reservation
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60 * 60);

pub use abstraction::{
    IncomingStreams, OpenStreamOptions, PeerStream, RelayPeer, Reservation, Transport,
    TransportError,
};
pub use backoff::DialBackoff;
pub use memory::{ConnectionKind, MemoryNetwork, MemoryTransport, RelayPolicy};
pub use swarm::{start_swarm, ConnectionSummary, NetworkEvent, SwarmCommand, SwarmHandle, SwarmOptions};

#[cfg(test)]
pub use abstraction::MockTransport;
