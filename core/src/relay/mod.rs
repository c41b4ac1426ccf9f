// Relay module: circuit addressing and relay-assisted connection setup

mod manager;

pub use crate::transport::{RelayPeer, Reservation};
pub use manager::{RelayConnectivityManager, RelayError};

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

/// `<relay-addr>/p2p/<relay>/p2p-circuit/p2p/<target>`
pub fn circuit_address(relay: &RelayPeer, target: PeerId) -> Multiaddr {
    relay
        .full_address()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_address_shape() {
        let relay_id = PeerId::random();
        let target = PeerId::random();
        let relay = RelayPeer {
            peer_id: relay_id,
            address: "/ip4/9.134.4.207/tcp/8000".parse().unwrap(),
        };

        let addr = circuit_address(&relay, target);
        assert_eq!(
            addr.to_string(),
            format!("/ip4/9.134.4.207/tcp/8000/p2p/{relay_id}/p2p-circuit/p2p/{target}")
        );
    }

    #[test]
    fn test_circuit_address_keeps_existing_relay_id() {
        let relay_id = PeerId::random();
        let target = PeerId::random();
        let address: Multiaddr = format!("/ip4/1.2.3.4/tcp/8000/p2p/{relay_id}").parse().unwrap();
        let relay = RelayPeer::from_multiaddr(address).unwrap();

        let addr = circuit_address(&relay, target);
        let p2p_count = addr.iter().filter(|p| matches!(p, Protocol::P2p(_))).count();
        assert_eq!(p2p_count, 2);
        assert_eq!(addr.iter().last(), Some(Protocol::P2p(target)));
    }
}
