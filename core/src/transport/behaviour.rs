// Combined NetworkBehaviour for a multipro node
//
// - relay_client: circuit relay v2 client (reservations, dialing via circuits)
// - relay_server: optional circuit relay v2 service for other peers
// - streams: raw per-protocol streams for the Ping/Echo handlers
// - identify: exchange listen addresses and public keys
// - kademlia: address book used when dialing by peer id

use libp2p::{
    identify, kad, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};
use std::time::Duration;

pub const IDENTIFY_PROTOCOL: &str = "/multipro/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub relay_client: relay::client::Behaviour,
    pub relay_server: Toggle<relay::Behaviour>,
    pub streams: libp2p_stream::Behaviour,
    pub identify: identify::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
}

impl NodeBehaviour {
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        relay_client: relay::client::Behaviour,
        relay_server: bool,
    ) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let relay_server = relay_server
            .then(|| relay::Behaviour::new(peer_id, relay::Config::default()));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60)),
        );

        let kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));

        Self {
            relay_client,
            relay_server: Toggle::from(relay_server),
            streams: libp2p_stream::Behaviour::new(),
            identify,
            kademlia,
        }
    }
}
