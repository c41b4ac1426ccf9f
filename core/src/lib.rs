// multipro core: authenticated request/response messaging between peers
//
// Two sub-protocols (Ping and Echo) exchange signed, correlated messages over
// named streams. Peers that cannot be dialed directly are reached through a
// circuit relay.

pub mod bootstrap;
pub mod config;
pub mod driver;
pub mod identity;
pub mod message;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use bootstrap::{bootstrap_connect, BootstrapError};
pub use config::{IdentityConfig, NodeConfig};
pub use driver::{Driver, PeerReport};
pub use identity::{load_identity, IdentityKeys};
pub use message::{EchoRequest, EchoResponse, MessageData, PingRequest, PingResponse};
pub use node::{NodeContext, PeerNode};
pub use protocol::{ExchangeEvent, ExchangeOutcome, ProtocolKind};
pub use relay::{circuit_address, RelayConnectivityManager, RelayError};
pub use transport::{
    start_swarm, MemoryNetwork, MemoryTransport, NetworkEvent, OpenStreamOptions, PeerStream,
    RelayPeer, Reservation, SwarmHandle, SwarmOptions, Transport, TransportError,
};
