// tests/integration/subscriptions_test.rs

//! Subscribe, unsubscribe and perform, driven over a real socket.

use super::test_helpers::{TestServer, chat_identifier};
use serde_json::json;

#[tokio::test]
async fn test_chat_subscribe_and_speak() {
    let server = TestServer::start().await;
    let mut client = server.connect_as("alice").await;
    let identifier = chat_identifier("lobby");

    client.subscribe_confirmed(&identifier).await;
    client
        .perform(&identifier, "speak", json!({ "message": "hello" }))
        .await;

    let pushed = client.recv().await.expect("No broadcast received");
    assert_eq!(
        pushed,
        json!({
            "identifier": identifier,
            "message": { "message": "hello", "from": "alice" },
        })
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_object_identifier_is_echoed_as_sent() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "ChatChannel", "room": "objects" });

    client
        .send_json(json!({ "command": "subscribe", "identifier": identifier }))
        .await;
    let reply = client.recv().await.expect("No subscription reply");
    assert_eq!(
        reply,
        json!({ "identifier": identifier, "type": "confirm_subscription" })
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_twice_is_idempotent() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = chat_identifier("twice");

    client.subscribe_confirmed(&identifier).await;
    client.subscribe(&identifier).await;
    client.expect_silence().await;

    assert_eq!(server.probe.subscribed(), 1);
    assert_eq!(server.state.streams.subscriber_count("chat_twice"), 1);

    client
        .perform(&identifier, "speak", json!({ "message": "once" }))
        .await;
    let pushed = client.recv().await.expect("No broadcast received");
    assert_eq!(pushed["message"]["message"], "once");
    client.expect_silence().await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_reordered_identifier_is_the_same_subscription() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .subscribe_confirmed(r#"{"channel":"ChatChannel","room":"order"}"#)
        .await;
    client
        .subscribe(r#"{"room":"order","channel":"ChatChannel"}"#)
        .await;
    client.expect_silence().await;
    assert_eq!(server.probe.subscribed(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_unknown_is_not_fatal() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.unsubscribe(&chat_identifier("nowhere")).await;
    client.expect_silence().await;

    // The connection keeps working.
    let identifier = chat_identifier("after");
    client.subscribe_confirmed(&identifier).await;
    assert_eq!(server.state.live_connection_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = chat_identifier("leaving");

    client.subscribe_confirmed(&identifier).await;
    let connection = server.state.connections_for("").remove(0);
    assert_eq!(connection.subscription_keys().len(), 1);

    client.unsubscribe(&identifier).await;
    server
        .wait_until("the stream to be released", |state| {
            state.streams.subscriber_count("chat_leaving") == 0
        })
        .await;
    assert!(connection.subscription_keys().is_empty());

    assert_eq!(server.state.broadcast("chat_leaving", json!("late")), 0);
    client.expect_silence().await;
    assert_eq!(server.probe.unsubscribed(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "GatedChannel" }).to_string();

    client.subscribe(&identifier).await;
    let reply = client.recv().await.expect("No subscription reply");
    assert_eq!(
        reply,
        json!({ "identifier": identifier, "type": "reject_subscription" })
    );

    // A rejected subscription can be retried and is rejected again.
    client.subscribe(&identifier).await;
    let reply = client.recv().await.expect("No subscription reply");
    assert_eq!(reply["type"], "reject_subscription");

    server.shutdown().await;
}

#[tokio::test]
async fn test_pubsub_channel_requires_stream_name() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = json!({ "channel": "$pubsub" }).to_string();

    client.subscribe(&identifier).await;
    let reply = client.recv().await.expect("No subscription reply");
    assert_eq!(reply["type"], "reject_subscription");

    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_frames_do_not_close_the_connection() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send_text("this is not json").await;
    client.send_json(json!({ "identifier": "{}" })).await;
    client
        .send_json(json!({ "command": "dance", "identifier": chat_identifier("x") }))
        .await;
    client
        .send_json(json!({ "command": "subscribe", "identifier": "{\"room\":\"1\"}" }))
        .await;
    client
        .subscribe(&json!({ "channel": "NoSuchChannel" }).to_string())
        .await;
    client.expect_silence().await;

    let identifier = chat_identifier("survivor");
    client.subscribe_confirmed(&identifier).await;
    client
        .perform(&identifier, "echo", json!({ "still": "here" }))
        .await;
    let echoed = client.recv().await.expect("No echo received");
    assert_eq!(echoed["message"], json!({ "still": "here" }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_failing_action_is_isolated() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    let identifier = chat_identifier("fragile");

    client.subscribe_confirmed(&identifier).await;
    client.perform(&identifier, "explode", json!({})).await;
    client.perform(&identifier, "no_such_action", json!({})).await;
    client
        .perform(&identifier, "echo", json!({ "n": 1 }))
        .await;

    let echoed = client.recv().await.expect("No echo received");
    assert_eq!(echoed["message"], json!({ "n": 1 }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_commands_sent_before_welcome_are_replayed_in_order() {
    let server = TestServer::start().await;
    let mut client = super::test_helpers::TestClient::connect(&server.url(), None)
        .await
        .expect("Failed to connect");
    let identifier = chat_identifier("early");

    // Sent without waiting for the welcome message.
    client.subscribe(&identifier).await;
    client
        .perform(&identifier, "echo", json!({ "seq": 1 }))
        .await;
    client
        .perform(&identifier, "echo", json!({ "seq": 2 }))
        .await;

    assert_eq!(client.recv().await, Some(json!({ "type": "welcome" })));
    assert_eq!(
        client.recv().await.expect("No confirmation")["type"],
        "confirm_subscription"
    );
    assert_eq!(client.recv().await.expect("No echo")["message"]["seq"], 1);
    assert_eq!(client.recv().await.expect("No echo")["message"]["seq"], 2);

    server.shutdown().await;
}
