// Driver loop: probe every known peer, falling back to the relay
//
// Per peer: sweep stale requests, ping directly, and on success echo
// directly too. A peer that cannot be pinged is reached through the relay
// with an echo on the circuit stream. Every attempt is followed by a fixed
// pause, and failures are simply retried on the next round.

use crate::node::PeerNode;
use crate::protocol::ECHO_REQUEST;
use crate::transport::Transport;
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::Duration;

/// How a peer was reached in one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerReport {
    Direct,
    Relayed,
    Unreachable { reason: String },
}

pub struct Driver<T: Transport> {
    node: Arc<PeerNode<T>>,
    peers: Vec<PeerId>,
    interval: Duration,
}

impl<T: Transport> Driver<T> {
    pub fn new(node: Arc<PeerNode<T>>, peers: Vec<PeerId>, interval: Duration) -> Self {
        Self {
            node,
            peers,
            interval,
        }
    }

    pub fn node(&self) -> &Arc<PeerNode<T>> {
        &self.node
    }

    async fn visit(&self, peer: PeerId) -> PeerReport {
        self.node.sweep();

        if self.node.ping(peer).await {
            if !self.node.echo(peer).await {
                tracing::warn!(peer = %peer, "Ping went through but echo did not");
            }
            return PeerReport::Direct;
        }
        tracing::info!(peer = %peer, "Peer not reachable directly");

        let Some(relay) = self.node.relay() else {
            return PeerReport::Unreachable {
                reason: "no relay configured".into(),
            };
        };

        match relay
            .connect_by_relay(peer, StreamProtocol::new(ECHO_REQUEST))
            .await
        {
            Ok(stream) => {
                if self.node.echo_protocol().echo_default_on_stream(stream).await {
                    PeerReport::Relayed
                } else {
                    PeerReport::Unreachable {
                        reason: "echo over relay circuit failed".into(),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer, step = e.step(), error = %e, "Relay connection failed");
                PeerReport::Unreachable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// One pass over the peer list, skipping ourselves
    pub async fn run_round(&self) -> Vec<(PeerId, PeerReport)> {
        let local = self.node.peer_id();
        let mut reports = Vec::new();

        for peer in self.peers.iter().copied().filter(|p| *p != local) {
            let report = self.visit(peer).await;
            if let PeerReport::Unreachable { reason } = &report {
                tracing::info!(peer = %peer, %reason, "Peer is down");
            }
            reports.push((peer, report));
            tokio::time::sleep(self.interval).await;
        }

        reports
    }

    /// Repeat rounds until the task is dropped
    pub async fn run(&self) {
        loop {
            let reports = self.run_round().await;
            if reports.is_empty() {
                tokio::time::sleep(self.interval.max(Duration::from_secs(1))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    fn node(net: &MemoryNetwork, seed: u8, nat: bool) -> Arc<PeerNode<MemoryTransport>> {
        let keys = IdentityKeys::from_seed(seed).unwrap();
        let transport = if nat {
            net.transport_behind_nat(keys.peer_id())
        } else {
            net.transport(keys.peer_id())
        };
        let node = PeerNode::new(keys, Arc::new(transport), "test/0.1");
        node.start().unwrap();
        Arc::new(node)
    }

    #[tokio::test]
    async fn test_round_skips_self() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1, false);
        let driver = Driver::new(a.clone(), vec![a.peer_id()], Duration::ZERO);
        assert!(driver.run_round().await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_peer() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1, false);
        let b = node(&net, 2, false);
        let driver = Driver::new(a.clone(), vec![a.peer_id(), b.peer_id()], Duration::ZERO);

        let reports = driver.run_round().await;
        assert_eq!(reports, vec![(b.peer_id(), PeerReport::Direct)]);
    }

    #[tokio::test]
    async fn test_unreachable_without_relay() {
        let net = MemoryNetwork::new();
        let a = node(&net, 1, false);
        let b = node(&net, 2, true);
        let driver = Driver::new(a.clone(), vec![b.peer_id()], Duration::ZERO);

        let reports = driver.run_round().await;
        assert!(matches!(reports[0].1, PeerReport::Unreachable { .. }));
    }
}
