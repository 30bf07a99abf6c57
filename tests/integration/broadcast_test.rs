// tests/integration/broadcast_test.rs

//! Fan-out across connections.

use super::test_helpers::{TestServer, chat_identifier};
use cableway::core::metrics::BROADCAST_DELIVERIES_TOTAL;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_two_connections_share_a_room() {
    let server = TestServer::start().await;
    let mut alice = server.connect_as("alice").await;
    let mut bob = server.connect_as("bob").await;
    let identifier = chat_identifier("shared-room");

    alice.subscribe_confirmed(&identifier).await;
    bob.subscribe_confirmed(&identifier).await;

    alice
        .perform(&identifier, "speak", json!({ "message": "hi bob" }))
        .await;

    let expected = json!({
        "identifier": identifier,
        "message": { "message": "hi bob", "from": "alice" },
    });
    assert_eq!(alice.recv().await, Some(expected.clone()));
    assert_eq!(bob.recv().await, Some(expected));

    server.shutdown().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    alice.subscribe_confirmed(&chat_identifier("one")).await;
    bob.subscribe_confirmed(&chat_identifier("two")).await;

    assert_eq!(server.state.broadcast("chat_one", json!("for one")), 1);
    assert_eq!(
        alice.recv().await.expect("No broadcast received")["message"],
        "for one"
    );
    bob.expect_silence().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_every_subscriber_receives_exactly_once_despite_a_failing_one() {
    const SUBSCRIBERS: usize = 5;
    let server = TestServer::start().await;
    let healthy = json!({ "channel": "SharedChannel" }).to_string();
    let fragile = json!({ "channel": "SharedChannel", "fragile": true }).to_string();

    let mut clients = Vec::new();
    for _ in 0..SUBSCRIBERS {
        let mut client = server.connect().await;
        client.subscribe_confirmed(&healthy).await;
        clients.push(client);
    }
    let mut broken = server.connect().await;
    broken.subscribe_confirmed(&fragile).await;

    let scheduled = server.state.broadcast("shared", json!({ "seq": 1 }));
    assert_eq!(scheduled, SUBSCRIBERS + 1);

    for client in clients.iter_mut() {
        let pushed = client.recv().await.expect("No broadcast received");
        assert_eq!(pushed, json!({ "identifier": healthy, "message": { "seq": 1 } }));
        client.expect_silence().await;
    }

    // The failing subscriber got nothing, but its connection is still usable.
    broken.expect_silence().await;
    broken.perform(&fragile, "echo", json!({ "ok": true })).await;
    let echoed = broken.recv().await.expect("No echo received");
    assert_eq!(echoed["message"], json!({ "ok": true }));
    assert_eq!(server.state.live_connection_count(), SUBSCRIBERS + 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pubsub_channel_streams_server_broadcasts() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "$pubsub", "stream_name": "news" }).to_string();

    client.subscribe_confirmed(&identifier).await;
    assert_eq!(server.state.broadcast("news", json!({ "headline": "up" })), 1);

    assert_eq!(
        client.recv().await,
        Some(json!({ "identifier": identifier, "message": { "headline": "up" } }))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_deliveries_counter_tracks_handled_payloads() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "$pubsub", "stream_name": "counted" }).to_string();
    client.subscribe_confirmed(&identifier).await;

    let before = BROADCAST_DELIVERIES_TOTAL.get();
    assert_eq!(server.state.broadcast("counted", json!("one")), 1);
    assert!(client.recv().await.is_some());

    // Other tests share the counter, so only a lower bound holds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while BROADCAST_DELIVERIES_TOTAL.get() < before + 1.0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery was never counted"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_order_is_preserved_per_connection() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "$pubsub", "stream_name": "ticks" }).to_string();
    client.subscribe_confirmed(&identifier).await;

    for seq in 0..20 {
        server.state.broadcast("ticks", json!(seq));
    }
    for seq in 0..20 {
        let pushed = client.recv().await.expect("No broadcast received");
        assert_eq!(pushed["message"], json!(seq));
    }

    server.shutdown().await;
}
