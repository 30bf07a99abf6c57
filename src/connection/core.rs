// src/connection/core.rs

//! Defines `Connection`, the per-client aggregate tying a socket to its
//! subscriptions, identity and worker lane.

use super::session::{ConnectionInfo, ConnectionPhase};
use super::tags::render_tags;
use crate::core::channel::{SubscriptionKeys, Subscriptions};
use crate::core::identity::{ConnectResult, ConnectionIdentity};
use crate::core::protocol::{CommandEnvelope, DisconnectReason, ServerMessage};
use crate::core::pubsub::remote::INTERNAL_CHANNEL_KEY;
use crate::core::pubsub::{ControlMessage, Delivery, StreamOwner, internal_stream};
use crate::core::runtime::{WorkerLane, isolate};
use crate::core::state::BrokerState;
use crate::core::transport::frame_socket::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use crate::core::transport::{
    Frame, FrameSocket, HandshakeRequest, MessageBuffer, Outbox, SocketListener,
};
use crate::core::{BrokerError, metrics};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};

/// One client connection.
///
/// Socket events arrive on an event-loop thread; everything that runs application
/// code (the connect hook, channel callbacks, broadcast handlers, teardown) is
/// posted to the connection's worker lane and runs there in order.
pub struct Connection {
    id: u64,
    me: Weak<Connection>,
    state: Arc<BrokerState>,
    socket: FrameSocket,
    buffer: MessageBuffer,
    lane: WorkerLane,
    request: HandshakeRequest,
    tags: String,
    started_at: DateTime<Utc>,
    phase: Mutex<ConnectionPhase>,
    identity: RwLock<ConnectionIdentity>,
    /// Created when the connection goes live, dropped when it closes.
    subscriptions: Mutex<Option<Subscriptions>>,
    /// Mirrors the keys of `subscriptions` without taking its lock.
    subscription_keys: SubscriptionKeys,
}

impl Connection {
    /// Creates a connection for an upgraded socket. The returned outbox must be
    /// handed to [`FrameSocket::serve`] together with the socket's stream.
    pub fn new(
        state: Arc<BrokerState>,
        id: u64,
        request: HandshakeRequest,
    ) -> (Arc<Self>, Outbox) {
        let tags = render_tags(&state.log_tags.read(), &request);
        let span = info_span!("connection", id, tags = %tags);
        let lane = state.worker_pool.lane(format!("connection-{id}"), span);
        let max_missed_pongs = state.config.max_missed_pongs;
        let max_buffered_frames = state.config.max_buffered_frames;
        let max_outbound_frames = state.config.max_outbound_frames;
        let (tx, outbox) = mpsc::unbounded_channel();

        let connection = Arc::new_cyclic(|me: &Weak<Connection>| {
            let listener: Weak<dyn SocketListener> = me.clone();
            let dispatcher = me.clone();
            Connection {
                id,
                me: me.clone(),
                state,
                socket: FrameSocket::with_outbox(
                    id,
                    max_missed_pongs,
                    max_outbound_frames,
                    listener,
                    tx,
                ),
                buffer: MessageBuffer::new(max_buffered_frames, move |text| {
                    if let Some(connection) = dispatcher.upgrade() {
                        connection.receive(text);
                    }
                }),
                lane,
                request,
                tags,
                started_at: Utc::now(),
                phase: Mutex::new(ConnectionPhase::Connecting),
                identity: RwLock::new(ConnectionIdentity::new()),
                subscriptions: Mutex::new(None),
                subscription_keys: SubscriptionKeys::default(),
            }
        });
        (connection, outbox)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &FrameSocket {
        &self.socket
    }

    pub fn lane(&self) -> &WorkerLane {
        &self.lane
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// The rendered log tags, e.g. `[req-1] [10.0.0.7]`.
    pub fn tags(&self) -> &str {
        &self.tags
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    pub fn is_live(&self) -> bool {
        self.phase() == ConnectionPhase::Live
    }

    pub fn identity(&self) -> ConnectionIdentity {
        self.identity.read().clone()
    }

    /// The canonical identifier of the connection's identity.
    pub fn identifier(&self) -> String {
        self.identity.read().identifier()
    }

    /// The channel keys this connection is subscribed to, sorted. Safe to call
    /// from inside a channel callback.
    pub fn subscription_keys(&self) -> Vec<String> {
        self.subscription_keys.read().iter().cloned().collect()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            identifier: self.identifier(),
            remote_addr: self.request.remote_addr,
            phase: self.phase(),
            started_at: self.started_at,
            subscriptions: self.subscription_keys(),
            tags: self.tags.clone(),
        }
    }

    /// Serializes `message` and queues it on the socket.
    pub fn transmit(&self, message: &ServerMessage) -> Result<(), BrokerError> {
        self.socket.send(message.encode())
    }

    /// Queues `job` on this connection's worker lane.
    pub fn send_async<F>(&self, job: F) -> Result<(), BrokerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.lane.post(job)
    }

    /// Schedules the dispatch of one inbound text frame.
    pub fn receive(&self, text: String) {
        let Some(connection) = self.me.upgrade() else {
            return;
        };
        if let Err(e) = self.send_async(move || connection.dispatch(&text)) {
            warn!("Dropping frame for connection {}: {}", self.id, e);
        }
    }

    /// Sends the application-level ping and a protocol ping.
    pub fn beat(&self) {
        if !self.socket.is_open() {
            return;
        }
        let now = Utc::now().timestamp();
        if self.transmit(&ServerMessage::Ping(now)).is_ok() && self.socket.ping().is_err() {
            debug!("Connection {} stopped answering pings.", self.id);
        }
    }

    /// Starts the closing handshake.
    pub fn close(&self, code: u16, reason: &str) {
        self.socket.close(code, reason);
    }

    /// Handles a disconnect control message for this connection's identity.
    pub fn remote_disconnect(&self, reconnect: bool) {
        info!(
            "Removing connection {} ({}) on remote request.",
            self.id,
            self.identifier()
        );
        let _ = self.transmit(&ServerMessage::Disconnect {
            reason: DisconnectReason::Remote,
            reconnect,
        });
        self.close(CLOSE_NORMAL, "remote");
    }

    /// Tells the client the server is going away and that it may come back.
    pub fn close_for_restart(&self) {
        let _ = self.transmit(&ServerMessage::Disconnect {
            reason: DisconnectReason::ServerRestart,
            reconnect: true,
        });
        self.close(CLOSE_GOING_AWAY, "server restart");
    }

    pub(crate) fn run_periodic(&self, key: &str, action: &str) {
        if let Some(subscriptions) = self.subscriptions.lock().as_mut() {
            subscriptions.run_periodic(key, action);
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match CommandEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::HANDLER_ERRORS_TOTAL
                    .with_label_values(&["protocol"])
                    .inc();
                error!("Could not decode frame on connection {}: {} ({})", self.id, e, text);
                return;
            }
        };

        let mut subscriptions = self.subscriptions.lock();
        match subscriptions.as_mut() {
            Some(subscriptions) => subscriptions.execute(&envelope),
            None => debug!(
                "Connection {} is not live; ignoring command {}.",
                self.id, envelope
            ),
        }
    }

    fn set_phase(&self, next: ConnectionPhase) -> ConnectionPhase {
        std::mem::replace(&mut *self.phase.lock(), next)
    }

    fn handle_open(&self) {
        if !self.socket.is_open() {
            debug!("Connection {} closed before it finished opening.", self.id);
            return;
        }

        let hooks = self.state.hooks.clone();
        match isolate(|| Ok(hooks.connect(&self.request))) {
            Ok(ConnectResult::Authorized(identity)) => self.go_live(identity),
            Ok(ConnectResult::Rejected(reason)) => {
                info!("An unauthorized connection attempt was rejected: {}", reason);
                self.set_phase(ConnectionPhase::Rejected);
                self.state.stats.increment_rejected_connections();
                metrics::CONNECTIONS_REJECTED_TOTAL
                    .with_label_values(&["unauthorized"])
                    .inc();
                let _ = self.transmit(&ServerMessage::Disconnect {
                    reason: DisconnectReason::Unauthorized,
                    reconnect: false,
                });
                self.close(CLOSE_NORMAL, "unauthorized");
            }
            Err(e) => {
                metrics::HANDLER_ERRORS_TOTAL
                    .with_label_values(&["connect"])
                    .inc();
                error!("Connect hook failed for connection {}: {}", self.id, e);
                self.set_phase(ConnectionPhase::Rejected);
                self.close(CLOSE_INTERNAL_ERROR, "connect failed");
            }
        }
    }

    fn go_live(&self, identity: ConnectionIdentity) {
        let Some(me) = self.me.upgrade() else {
            return;
        };

        *self.identity.write() = identity.clone();
        *self.subscriptions.lock() = Some(Subscriptions::new(
            self.me.clone(),
            self.id,
            identity.clone(),
            self.state.clone(),
            self.subscription_keys.clone(),
        ));
        if !identity.is_empty() {
            self.listen_for_control(&identity.identifier());
        }
        self.set_phase(ConnectionPhase::Live);

        if let Err(e) = self.transmit(&ServerMessage::Welcome) {
            debug!("Could not welcome connection {}: {}", self.id, e);
        }
        self.buffer.mark_ready();
        self.beat();

        self.state.connections.insert(self.id, me);
        metrics::LIVE_CONNECTIONS.inc();
        info!(
            "Connection {} is live (identifier: '{}').",
            self.id,
            identity.identifier()
        );
    }

    fn listen_for_control(&self, identifier: &str) {
        let weak = self.me.clone();
        let lane = self.lane.clone();
        let deliver: Delivery = Arc::new(move |payload: Arc<Value>| {
            let weak = weak.clone();
            let posted = lane.post(move || {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match serde_json::from_value::<ControlMessage>((*payload).clone()) {
                    Ok(ControlMessage::Disconnect { reconnect }) => {
                        connection.remote_disconnect(reconnect)
                    }
                    Err(e) => warn!("Ignoring malformed control message {}: {}", payload, e),
                }
            });
            if posted.is_err() {
                debug!("Control message dropped: worker lane closed.");
            }
        });
        self.state.streams.add(
            StreamOwner::new(self.id, INTERNAL_CHANNEL_KEY),
            &internal_stream(identifier),
            deliver,
        );
    }

    fn handle_close(&self, code: u16, reason: &str) {
        let previous = self.set_phase(ConnectionPhase::Closing);
        if previous.is_finished() {
            self.set_phase(previous);
            return;
        }

        let subscriptions = self.subscriptions.lock().take();
        if let Some(mut subscriptions) = subscriptions {
            subscriptions.unsubscribe_all();
        }
        self.release();

        if previous == ConnectionPhase::Live {
            let identity = self.identity();
            let hooks = self.state.hooks.clone();
            if let Err(e) = isolate(|| {
                hooks.disconnect(&identity);
                Ok(())
            }) {
                metrics::HANDLER_ERRORS_TOTAL
                    .with_label_values(&["disconnect"])
                    .inc();
                error!("Disconnect hook failed for connection {}: {}", self.id, e);
            }
        }

        self.set_phase(ConnectionPhase::Closed);
        info!(
            "Finished \"{}\" [WebSocket] for {} ({} {})",
            self.request.path,
            self.request.remote_addr.ip(),
            code,
            reason
        );
    }

    /// Drops every broker-level reference to this connection. Runs no application code.
    fn release(&self) {
        let removed = self.state.streams.remove_connection(self.id);
        if removed > 0 {
            debug!(
                "Removed {} stream registrations of connection {}.",
                removed, self.id
            );
        }
        if self.state.connections.remove(&self.id).is_some() {
            metrics::LIVE_CONNECTIONS.dec();
        }
    }
}

impl SocketListener for Connection {
    fn on_open(&self) {
        let Some(connection) = self.me.upgrade() else {
            return;
        };
        self.set_phase(ConnectionPhase::Open);
        if let Err(e) = self.send_async(move || connection.handle_open()) {
            warn!("Connection {} could not be opened: {}", self.id, e);
            self.close(CLOSE_GOING_AWAY, "server shutting down");
        }
    }

    fn on_message(&self, frame: Frame) {
        match self.buffer.append(frame) {
            Ok(()) => {}
            Err(BrokerError::BufferOverflow(limit)) => {
                error!(
                    "Connection {} sent more than {} frames before it was ready; closing.",
                    self.id, limit
                );
                self.close(CLOSE_POLICY_VIOLATION, "buffer overflow");
            }
            Err(e) => {
                metrics::HANDLER_ERRORS_TOTAL
                    .with_label_values(&["protocol"])
                    .inc();
                error!("Connection {}: {}", self.id, e);
            }
        }
    }

    fn on_close(&self, code: u16, reason: &str) {
        debug!("Socket {} closed ({} {}).", self.id, code, reason);
        let Some(connection) = self.me.upgrade() else {
            return;
        };
        let reason_owned = reason.to_string();
        if self
            .send_async(move || connection.handle_close(code, &reason_owned))
            .is_err()
        {
            // The worker pool is gone; skip the hooks but leave no dangling registrations.
            self.set_phase(ConnectionPhase::Closed);
            self.release();
        }
    }

    fn on_error(&self, error: &BrokerError) {
        warn!("WebSocket error on connection {}: {}", self.id, error);
    }
}
