//! Shared setup for the in-memory multi-node tests

#![allow(dead_code)]

use multipro_core::protocol::{ExchangeEvent, ExchangeOutcome, ProtocolKind};
use multipro_core::{IdentityKeys, MemoryNetwork, MemoryTransport, PeerNode, RelayPeer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub type Node = PeerNode<MemoryTransport>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Relay address as the nodes are configured with it
pub fn relay_peer(relay: &IdentityKeys) -> RelayPeer {
    let address = format!("/memory/4001/p2p/{}", relay.peer_id())
        .parse()
        .expect("valid relay address");
    RelayPeer::from_multiaddr(address).expect("relay address carries a peer id")
}

pub struct Spawn<'a> {
    pub net: &'a MemoryNetwork,
    pub seed: u8,
    pub behind_nat: bool,
    pub relay: Option<RelayPeer>,
}

impl<'a> Spawn<'a> {
    pub fn new(net: &'a MemoryNetwork, seed: u8) -> Self {
        Self {
            net,
            seed,
            behind_nat: false,
            relay: None,
        }
    }

    pub fn behind_nat(mut self) -> Self {
        self.behind_nat = true;
        self
    }

    pub fn relay(mut self, relay: RelayPeer) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Build and start the node
    pub fn start(self) -> Arc<Node> {
        let keys = IdentityKeys::from_seed(self.seed).expect("seeded identity");
        let transport = if self.behind_nat {
            self.net.transport_behind_nat(keys.peer_id())
        } else {
            self.net.transport(keys.peer_id())
        };
        let mut node = PeerNode::new(keys, Arc::new(transport), "multipro-test/0.1");
        if let Some(relay) = self.relay {
            node = node.with_relay(relay);
        }
        node.start().expect("handlers register");
        Arc::new(node)
    }
}

/// Next event matching `protocol` and `outcome_matches`, within five seconds
pub async fn wait_for(
    events: &mut broadcast::Receiver<ExchangeEvent>,
    protocol: ProtocolKind,
    outcome_matches: impl Fn(&ExchangeOutcome) -> bool,
) -> ExchangeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if event.protocol == protocol && outcome_matches(&event.outcome) {
                return event;
            }
        }
    })
    .await
    .expect("expected exchange event")
}

pub fn is_matched(outcome: &ExchangeOutcome) -> bool {
    matches!(outcome, ExchangeOutcome::Matched { .. })
}
