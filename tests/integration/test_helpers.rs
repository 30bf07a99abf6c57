// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests: a broker bound to an
//! ephemeral port, a WebSocket test client, and a few sample channels.

#![allow(dead_code)]

use cableway::BrokerError;
use cableway::Server;
use cableway::config::Config;
use cableway::core::channel::{Channel, ChannelContext, PUBSUB_CHANNEL, StreamChannel};
use cableway::core::identity::{ConnectResult, ConnectionHooks, ConnectionIdentity};
use cableway::core::state::BrokerState;
use cableway::core::transport::HandshakeRequest;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts channel and hook callbacks so tests can assert on teardown.
#[derive(Default)]
pub struct Probe {
    pub subscribed: AtomicUsize,
    pub unsubscribed: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl Probe {
    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn unsubscribed(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

/// Authorizes `?token=<name>` as `user=<name>`; `?token=bad` is rejected and a
/// missing token connects anonymously.
pub struct TokenHooks {
    pub probe: Arc<Probe>,
}

impl ConnectionHooks for TokenHooks {
    fn connect(&self, request: &HandshakeRequest) -> ConnectResult {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        match request.query_param("token") {
            Some("bad") => ConnectResult::Rejected("bad token".into()),
            Some(token) => ConnectResult::Authorized(ConnectionIdentity::new().with("user", token)),
            None => ConnectResult::Authorized(ConnectionIdentity::new()),
        }
    }

    fn disconnect(&self, _identity: &ConnectionIdentity) {
        self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Streams `chat_<room>`; `speak` rebroadcasts the message to the room,
/// `echo` answers only the caller and `nap` blocks for `ms` milliseconds.
pub struct ChatChannel {
    pub probe: Arc<Probe>,
}

impl Channel for ChatChannel {
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        self.probe.subscribed.fetch_add(1, Ordering::SeqCst);
        let room = ctx.param_str("room").unwrap_or("lobby").to_string();
        ctx.stream_from(&format!("chat_{room}"))
    }

    fn unsubscribed(&mut self, _ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        self.probe.unsubscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn perform(
        &mut self,
        action: &str,
        data: &Map<String, Value>,
        ctx: &mut ChannelContext,
    ) -> Result<(), BrokerError> {
        match action {
            "speak" => {
                let room = ctx.param_str("room").unwrap_or("lobby").to_string();
                let message = data.get("message").cloned().unwrap_or(Value::Null);
                let speaker = ctx.identity().get("user").unwrap_or("anonymous").to_string();
                ctx.broadcast(
                    &format!("chat_{room}"),
                    json!({ "message": message, "from": speaker }),
                );
                Ok(())
            }
            "echo" => ctx.transmit(Value::Object(data.clone())),
            "nap" => {
                let ms = data.get("ms").and_then(Value::as_u64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                ctx.transmit(json!({ "napped": ms }))
            }
            "explode" => panic!("exploding on request"),
            other => Err(BrokerError::UnknownAction {
                channel: "ChatChannel".into(),
                action: other.to_string(),
            }),
        }
    }
}

/// Always rejects the subscription.
pub struct GatedChannel;

impl Channel for GatedChannel {
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        ctx.reject();
        Ok(())
    }
}

/// Streams `shared`; a subscription created with `"fragile": true` fails on
/// every delivery.
pub struct SharedChannel;

impl Channel for SharedChannel {
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        let fragile = ctx
            .params()
            .get("fragile")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        ctx.stream_from_with("shared", move |payload, transmitter| {
            if fragile {
                panic!("fragile subscriber cannot take {payload}");
            }
            transmitter.transmit(payload.clone())
        })
    }

    fn perform(
        &mut self,
        action: &str,
        data: &Map<String, Value>,
        ctx: &mut ChannelContext,
    ) -> Result<(), BrokerError> {
        match action {
            "echo" => ctx.transmit(Value::Object(data.clone())),
            other => Err(BrokerError::UnknownAction {
                channel: "SharedChannel".into(),
                action: other.to_string(),
            }),
        }
    }
}

/// A broker running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<BrokerState>,
    pub probe: Arc<Probe>,
    stop: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.port = 0;
    config.disable_request_forgery_protection = true;
    config.heartbeat_interval = Duration::from_secs(3600);
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

impl TestServer {
    /// Starts a broker with the sample channels and [`TokenHooks`].
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::with_setup(config, |_| {}).await
    }

    /// Like [`with_config`](Self::with_config), running `setup` on the state
    /// before the server starts accepting.
    pub async fn with_setup<F>(config: Config, setup: F) -> Self
    where
        F: FnOnce(&BrokerState),
    {
        init_tracing();
        let probe = Arc::new(Probe::default());
        let hooks = Arc::new(TokenHooks {
            probe: probe.clone(),
        });
        let server = Server::bind(config, hooks)
            .await
            .expect("Failed to bind test server");

        let channels = &server.state().channels;
        let chat_probe = probe.clone();
        channels.register("ChatChannel", move |_identifier| ChatChannel {
            probe: chat_probe.clone(),
        });
        channels.register("GatedChannel", |_identifier| GatedChannel);
        channels.register("SharedChannel", |_identifier| SharedChannel);
        channels.register(PUBSUB_CHANNEL, |_identifier| StreamChannel);
        setup(server.state());

        let addr = server.local_addr().expect("Failed to read local address");
        let state = server.state().clone();
        let stop = server.stop_token();
        let handle = tokio::spawn(server.run());

        Self {
            addr,
            state,
            probe,
            stop,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/cable", self.addr)
    }

    /// Connects and waits for the welcome message.
    pub async fn connect(&self) -> TestClient {
        self.connect_to(&self.url()).await
    }

    pub async fn connect_as(&self, token: &str) -> TestClient {
        self.connect_to(&format!("{}?token={token}", self.url()))
            .await
    }

    async fn connect_to(&self, url: &str) -> TestClient {
        let mut client = TestClient::connect(url, None)
            .await
            .expect("Failed to connect test client");
        let welcome = client.recv().await.expect("No welcome message");
        assert_eq!(welcome, json!({ "type": "welcome" }));
        client
    }

    /// Polls until `condition` holds, failing the test after five seconds.
    pub async fn wait_until<F>(&self, what: &str, condition: F)
    where
        F: Fn(&BrokerState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while !condition(&self.state) {
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

/// A minimal client speaking the broker's JSON protocol.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

pub fn chat_identifier(room: &str) -> String {
    json!({ "channel": "ChatChannel", "room": room }).to_string()
}

impl TestClient {
    pub async fn connect(
        url: &str,
        origin: Option<&str>,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request()?;
        if let Some(origin) = origin {
            request.headers_mut().insert(
                "Origin",
                HeaderValue::from_str(origin).expect("Invalid origin header"),
            );
        }
        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { ws })
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::text(text.to_string()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn subscribe(&mut self, identifier: &str) {
        self.send_json(json!({ "command": "subscribe", "identifier": identifier }))
            .await;
    }

    pub async fn unsubscribe(&mut self, identifier: &str) {
        self.send_json(json!({ "command": "unsubscribe", "identifier": identifier }))
            .await;
    }

    pub async fn perform(&mut self, identifier: &str, action: &str, mut data: Value) {
        if let Value::Object(fields) = &mut data {
            fields.insert("action".into(), Value::String(action.to_string()));
        }
        self.send_json(json!({
            "command": "message",
            "identifier": identifier,
            "data": data.to_string(),
        }))
        .await;
    }

    /// Subscribes and waits for the confirmation.
    pub async fn subscribe_confirmed(&mut self, identifier: &str) {
        self.subscribe(identifier).await;
        let reply = self.recv().await.expect("No subscription reply");
        assert_eq!(
            reply,
            json!({ "identifier": identifier, "type": "confirm_subscription" })
        );
    }

    /// The next JSON message, skipping heartbeats. `None` once the socket is
    /// closed or nothing arrives within five seconds.
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(RECV_TIMEOUT).await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match next.ok()? {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).ok()?;
                    if value.get("type") == Some(&json!("ping")) {
                        continue;
                    }
                    return Some(value);
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Asserts that no message other than heartbeats arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Some(value) = self.recv_within(Duration::from_millis(200)).await {
            panic!("Expected no message, got {value}");
        }
    }

    /// Waits for the server to close the socket, returning the close code.
    pub async fn closed(&mut self) -> Option<u16> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => panic!("Timed out waiting for the socket to close"),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Drops the TCP connection without a closing handshake.
    pub fn drop_abruptly(self) {
        drop(self);
    }
}
