//! Ping and Echo exchanges between nodes sharing an in-memory network
//!
//! Run with: cargo test --test integration_exchange

mod common;

use common::{init_tracing, is_matched, wait_for, Spawn};
use multipro_core::message::{encode_frame, new_message_data, sign_in_place};
use multipro_core::protocol::{ExchangeOutcome, ProtocolKind, ECHO_REQUEST};
use multipro_core::{EchoRequest, IdentityKeys, MemoryNetwork, OpenStreamOptions, Transport};
use libp2p::StreamProtocol;
use proptest::prelude::*;

#[tokio::test]
async fn test_ping_is_received_without_reply() {
    init_tracing();
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let bob = Spawn::new(&net, 2).start();
    let mut bob_events = bob.subscribe();

    assert!(alice.ping(bob.peer_id()).await);

    let event = wait_for(&mut bob_events, ProtocolKind::Ping, |o| {
        *o == ExchangeOutcome::RequestReceived
    })
    .await;
    assert_eq!(event.peer, alice.peer_id());

    // Probes are never answered, so the request stays pending until swept
    assert_eq!(alice.ping_protocol().pending().len(), 1);
    assert!(alice.ping_protocol().pending().contains(&event.message_id));
}

#[tokio::test]
async fn test_echo_round_trip_preserves_text() {
    init_tracing();
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let bob = Spawn::new(&net, 2).start();
    let mut alice_events = alice.subscribe();

    for text in ["", "hello", "line one\nline two\r\n", "\n", "tab\tand ünïcödé"] {
        assert!(alice.echo_with(bob.peer_id(), text).await);
        let event = wait_for(&mut alice_events, ProtocolKind::Echo, is_matched).await;
        assert_eq!(event.peer, bob.peer_id());
        assert_eq!(
            event.outcome,
            ExchangeOutcome::Matched {
                payload: text.to_string()
            }
        );
    }

    assert!(alice.echo_protocol().pending().is_empty());
}

#[tokio::test]
async fn test_concurrent_echoes_all_complete() {
    init_tracing();
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let bob = Spawn::new(&net, 2).start();
    let mut alice_events = alice.subscribe();

    let sends = (0..10).map(|i| {
        let alice = alice.clone();
        let bob_id = bob.peer_id();
        tokio::spawn(async move { alice.echo_with(bob_id, format!("message {i}")).await })
    });
    for send in futures::future::join_all(sends).await {
        assert!(send.unwrap());
    }

    let mut ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let event = wait_for(&mut alice_events, ProtocolKind::Echo, is_matched).await;
        assert!(ids.insert(event.message_id));
    }
    assert!(alice.echo_protocol().pending().is_empty());
}

#[tokio::test]
async fn test_both_directions_at_once() {
    init_tracing();
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let bob = Spawn::new(&net, 2).start();
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let (a, b) = tokio::join!(alice.echo(bob.peer_id()), bob.echo(alice.peer_id()));
    assert!(a && b);

    wait_for(&mut alice_events, ProtocolKind::Echo, is_matched).await;
    wait_for(&mut bob_events, ProtocolKind::Echo, is_matched).await;
}

#[tokio::test]
async fn test_spoofed_request_is_dropped() {
    init_tracing();
    let net = MemoryNetwork::new();
    let bob = Spawn::new(&net, 2).start();
    let mut bob_events = bob.subscribe();

    let mallory = IdentityKeys::from_seed(66).unwrap();
    let victim = IdentityKeys::from_seed(1).unwrap();
    let mallory_transport = net.transport(mallory.peer_id());

    let mut request = EchoRequest {
        message_data: new_message_data(&mallory, "evil/1.0", "spoof-1".into(), false),
        message: "trust me".into(),
    };
    request.message_data.node_id = victim.peer_id().to_base58();
    sign_in_place(&mallory, &mut request).unwrap();

    let mut stream = mallory_transport
        .open_stream(
            bob.peer_id(),
            StreamProtocol::new(ECHO_REQUEST),
            OpenStreamOptions::direct(),
        )
        .await
        .unwrap();
    stream.write_all(&encode_frame(&request).unwrap()).await.unwrap();
    stream.close().await.unwrap();

    let event = wait_for(&mut bob_events, ProtocolKind::Echo, |o| {
        matches!(o, ExchangeOutcome::Dropped { .. })
    })
    .await;
    assert_eq!(event.message_id, "spoof-1");
}

#[tokio::test]
async fn test_garbage_on_request_stream_is_dropped() {
    init_tracing();
    let net = MemoryNetwork::new();
    let bob = Spawn::new(&net, 2).start();
    let mut bob_events = bob.subscribe();
    let stranger = net.transport(IdentityKeys::from_seed(9).unwrap().peer_id());

    let mut stream = stranger
        .open_stream(
            bob.peer_id(),
            StreamProtocol::new(ECHO_REQUEST),
            OpenStreamOptions::direct(),
        )
        .await
        .unwrap();
    stream.write_all(b"\x00\x00\x00\x03abc").await.unwrap();
    stream.close().await.unwrap();

    wait_for(&mut bob_events, ProtocolKind::Echo, |o| {
        matches!(o, ExchangeOutcome::Dropped { .. })
    })
    .await;
}

#[tokio::test]
async fn test_echo_to_absent_peer_fails() {
    let net = MemoryNetwork::new();
    let alice = Spawn::new(&net, 1).start();
    let nobody = IdentityKeys::from_seed(99).unwrap().peer_id();

    assert!(!alice.echo(nobody).await);
    // the entry stays until the sweeper evicts it
    assert_eq!(alice.echo_protocol().pending().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_echo_returns_payload_verbatim(text in "(?s).{0,256}") {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let payload = rt.block_on(async {
            let net = MemoryNetwork::new();
            let alice = Spawn::new(&net, 1).start();
            let bob = Spawn::new(&net, 2).start();
            let mut events = alice.subscribe();
            assert!(alice.echo_with(bob.peer_id(), text.clone()).await);
            match wait_for(&mut events, ProtocolKind::Echo, is_matched).await.outcome {
                ExchangeOutcome::Matched { payload } => payload,
                other => panic!("unexpected outcome {other:?}"),
            }
        });
        prop_assert_eq!(payload, text);
    }
}
