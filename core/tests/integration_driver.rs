//! Driver rounds over a mixed network of direct and NAT-ed peers
//!
//! Run with: cargo test --test integration_driver

mod common;

use common::{init_tracing, is_matched, relay_peer, wait_for, Spawn};
use multipro_core::protocol::ProtocolKind;
use multipro_core::transport::RelayPolicy;
use multipro_core::{Driver, IdentityKeys, MemoryNetwork, PeerReport};
use std::time::Duration;

#[tokio::test]
async fn test_round_reaches_direct_and_relayed_peers() {
    init_tracing();
    let net = MemoryNetwork::new();
    let relay_keys = IdentityKeys::from_seed(10).unwrap();
    net.add_relay(relay_keys.peer_id(), RelayPolicy::Accept);
    let relay = relay_peer(&relay_keys);

    let alice = Spawn::new(&net, 1).relay(relay.clone()).start();
    let bob = Spawn::new(&net, 2).behind_nat().relay(relay.clone()).start();
    let carol = Spawn::new(&net, 3).relay(relay).start();
    bob.reserve_relay().await.unwrap().unwrap();
    let mut alice_events = alice.subscribe();

    let peers = vec![alice.peer_id(), bob.peer_id(), carol.peer_id()];
    let driver = Driver::new(alice.clone(), peers, Duration::from_millis(10));

    let reports = driver.run_round().await;
    assert_eq!(
        reports,
        vec![
            (bob.peer_id(), PeerReport::Relayed),
            (carol.peer_id(), PeerReport::Direct),
        ]
    );

    let mut answered = Vec::new();
    for _ in 0..2 {
        answered.push(wait_for(&mut alice_events, ProtocolKind::Echo, is_matched).await.peer);
    }
    assert!(answered.contains(&bob.peer_id()));
    assert!(answered.contains(&carol.peer_id()));
}

#[tokio::test]
async fn test_unreachable_peer_is_retried_next_round() {
    init_tracing();
    let net = MemoryNetwork::new();
    let relay_keys = IdentityKeys::from_seed(10).unwrap();
    net.add_relay(relay_keys.peer_id(), RelayPolicy::Accept);
    let relay = relay_peer(&relay_keys);

    let alice = Spawn::new(&net, 1).relay(relay.clone()).start();
    let bob = Spawn::new(&net, 2).behind_nat().relay(relay).start();

    let driver = Driver::new(alice.clone(), vec![bob.peer_id()], Duration::ZERO);

    // bob holds no reservation yet, so the circuit dial fails
    let first = driver.run_round().await;
    assert!(matches!(first[0].1, PeerReport::Unreachable { .. }));

    bob.reserve_relay().await.unwrap().unwrap();

    // both the failed direct dial and the failed circuit left backoff entries;
    // the relay path clears them before dialing again
    let second = driver.run_round().await;
    assert_eq!(second, vec![(bob.peer_id(), PeerReport::Relayed)]);
}

#[tokio::test]
async fn test_denied_relay_reports_unreachable() {
    init_tracing();
    let net = MemoryNetwork::new();
    let relay_keys = IdentityKeys::from_seed(10).unwrap();
    net.add_relay(relay_keys.peer_id(), RelayPolicy::Deny);
    let relay = relay_peer(&relay_keys);

    let alice = Spawn::new(&net, 1).relay(relay).start();
    let bob = Spawn::new(&net, 2).behind_nat().start();

    let driver = Driver::new(alice.clone(), vec![bob.peer_id()], Duration::ZERO);
    let reports = driver.run_round().await;
    match &reports[0].1 {
        PeerReport::Unreachable { reason } => assert!(reason.contains("denied")),
        other => panic!("unexpected report {other:?}"),
    }
}

#[tokio::test]
async fn test_run_keeps_going() {
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let bob = Spawn::new(&net, 2).start();
    let mut bob_events = bob.subscribe();

    let driver = Driver::new(alice.clone(), vec![bob.peer_id()], Duration::from_millis(50));
    let run = tokio::spawn(async move { driver.run().await });

    // one ping per round
    for _ in 0..3 {
        wait_for(&mut bob_events, ProtocolKind::Ping, |o| {
            *o == multipro_core::ExchangeOutcome::RequestReceived
        })
        .await;
    }

    run.abort();
}
