// tests/integration/connection_test.rs

//! Connection lifecycle: handshake checks, authorization, teardown and shutdown.

use super::test_helpers::{TestClient, TestServer, chat_identifier, test_config};
use cableway::LogTag;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite;

#[tokio::test]
async fn test_welcome_then_live() {
    let server = TestServer::start().await;
    let _client = server.connect_as("alice").await;

    server
        .wait_until("the connection to go live", |state| {
            state.live_connection_count() == 1
        })
        .await;
    let live = server.state.connections_for("alice");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].identity().get("user"), Some("alice"));
    assert_eq!(server.state.stats.get_total_connections(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unauthorized_connection_is_told_not_to_reconnect() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&format!("{}?token=bad", server.url()), None)
        .await
        .expect("The upgrade itself should succeed");

    let reply = client.recv().await.expect("No disconnect message");
    assert_eq!(
        reply,
        json!({ "type": "disconnect", "reason": "unauthorized", "reconnect": false })
    );
    assert_eq!(client.closed().await, Some(1000));

    assert_eq!(server.state.live_connection_count(), 0);
    assert_eq!(server.state.stats.get_rejected_connections(), 1);
    // The disconnect hook only runs for connections that went live.
    assert_eq!(server.probe.disconnects(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_forbidden_origin_is_rejected_before_upgrade() {
    let mut config = test_config();
    config.disable_request_forgery_protection = false;
    config.allowed_request_origins = vec!["https://allowed.example".to_string()];
    let server = TestServer::with_config(config).await;

    let result = TestClient::connect(&server.url(), Some("https://evil.example")).await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        Err(other) => panic!("Expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("Upgrade from a forbidden origin succeeded"),
    }

    server
        .wait_until("the rejection to be counted", |state| {
            state.stats.get_rejected_connections() == 1
        })
        .await;
    assert_eq!(server.probe.connects.load(std::sync::atomic::Ordering::SeqCst), 0);

    // An allowed origin still gets in.
    let mut client = TestClient::connect(&server.url(), Some("https://allowed.example"))
        .await
        .expect("Allowed origin was rejected");
    assert_eq!(client.recv().await, Some(json!({ "type": "welcome" })));

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_origin_is_rejected_when_protection_is_on() {
    let mut config = test_config();
    config.disable_request_forgery_protection = false;
    let server = TestServer::with_config(config).await;

    let result = TestClient::connect(&server.url(), None).await;
    assert!(matches!(result, Err(tungstenite::Error::Http(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_path_is_not_found() {
    let server = TestServer::start().await;

    let result = TestClient::connect(&format!("ws://{}/elsewhere", server.addr), None).await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 404);
        }
        _ => panic!("Expected a 404 rejection"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_eof_tears_everything_down() {
    let server = TestServer::start().await;
    let mut client = server.connect_as("carol").await;
    client.subscribe_confirmed(&chat_identifier("a")).await;
    client.subscribe_confirmed(&chat_identifier("b")).await;
    assert_eq!(server.state.streams.stream_names().len(), 3);

    client.drop_abruptly();

    server
        .wait_until("teardown to finish", |state| {
            state.live_connection_count() == 0 && state.streams.is_empty()
        })
        .await;
    server
        .wait_until("the disconnect hook", |_| server.probe.disconnects() == 1)
        .await;
    assert_eq!(server.probe.unsubscribed(), 2);
    assert_eq!(server.state.broadcast("chat_a", json!("anyone?")), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_close_runs_disconnect_hook_once() {
    let server = TestServer::start().await;
    let mut client = server.connect_as("dave").await;
    client.subscribe_confirmed(&chat_identifier("bye")).await;

    client.close().await;

    server
        .wait_until("the disconnect hook", |_| server.probe.disconnects() == 1)
        .await;
    assert_eq!(server.probe.unsubscribed(), 1);
    assert!(server.state.connections_for("dave").is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_disconnect_by_identifier() {
    let server = TestServer::start().await;
    let mut target = server.connect_as("erin").await;
    let mut bystander = server.connect_as("frank").await;

    let scheduled = server.state.remote_disconnect("erin", false);
    assert_eq!(scheduled, 1);

    assert_eq!(
        target.recv().await,
        Some(json!({ "type": "disconnect", "reason": "remote", "reconnect": false }))
    );
    assert_eq!(target.closed().await, Some(1000));
    bystander.expect_silence().await;

    server
        .wait_until("the target to be removed", |state| {
            state.connections_for("erin").is_empty()
        })
        .await;
    assert_eq!(server.state.connections_for("frank").len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_connections_have_no_control_stream() {
    let server = TestServer::start().await;
    let _client = server.connect().await;

    assert_eq!(server.state.remote_disconnect("", true), 0);
    assert!(server.state.streams.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_sends_restart_notice() {
    let server = TestServer::start().await;
    let mut client = server.connect_as("gina").await;

    server.shutdown().await;

    assert_eq!(
        client.recv().await,
        Some(json!({ "type": "disconnect", "reason": "server_restart", "reconnect": true }))
    );
}

#[tokio::test]
async fn test_max_clients_turns_extra_sockets_away() {
    let mut config = test_config();
    config.max_clients = 1;
    let server = TestServer::with_config(config).await;
    let _first = server.connect().await;

    let second = TestClient::connect(&server.url(), None).await;
    assert!(second.is_err());

    server
        .wait_until("the rejection to be counted", |state| {
            state.stats.get_rejected_connections() == 1
        })
        .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_pings_tear_the_connection_down() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(100);
    config.max_missed_pongs = 2;
    let server = TestServer::with_config(config).await;
    let mut client = server.connect_as("ivan").await;
    client.subscribe_confirmed(&chat_identifier("quiet")).await;

    // From here on the client never reads, so no pong is ever sent.
    server
        .wait_until("the silent client to be dropped", |state| {
            state.live_connection_count() == 0 && state.streams.is_empty()
        })
        .await;
    server
        .wait_until("the disconnect hook", |_| server.probe.disconnects() == 1)
        .await;
    assert_eq!(server.probe.unsubscribed(), 1);
    assert!(server.state.connections_for("ivan").is_empty());
    assert_eq!(server.state.remote_disconnect("ivan", true), 0);

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_log_tags_from_config_and_code() {
    let mut config = test_config();
    config.log_tags = vec!["query:token".to_string(), "cookie:missing".to_string()];
    let server = TestServer::with_setup(config, |state| {
        state.add_log_tag(LogTag::dynamic(|request| format!("path={}", request.path)));
    })
    .await;
    let _client = server.connect_as("zoe").await;

    server
        .wait_until("the connection to go live", |state| {
            state.live_connection_count() == 1
        })
        .await;
    let live = server.state.connections_for("zoe");
    assert_eq!(live[0].tags(), "[zoe] [-] [path=/cable]");
    assert_eq!(live[0].info().tags, "[zoe] [-] [path=/cable]");

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_info_is_not_blocked_by_a_running_action() {
    let server = TestServer::start().await;
    let mut client = server.connect_as("uma").await;
    let identifier = chat_identifier("slow");
    client.subscribe_confirmed(&identifier).await;

    client.perform(&identifier, "nap", json!({ "ms": 1500 })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connection = server.state.connections_for("uma").remove(0);
    let started = Instant::now();
    let info = tokio::task::spawn_blocking(move || connection.info())
        .await
        .expect("info() panicked");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "info() waited {:?} for the running action",
        started.elapsed()
    );
    assert_eq!(info.subscriptions.len(), 1);

    assert_eq!(
        client.recv().await,
        Some(json!({ "identifier": identifier, "message": { "napped": 1500 } }))
    );
    server.shutdown().await;
}
