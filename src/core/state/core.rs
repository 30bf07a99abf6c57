// src/core/state/core.rs

//! Defines the central `BrokerState` struct, holding all shared broker-wide state.

use super::stats::StatsState;
use crate::config::Config;
use crate::connection::{Connection, LogTag};
use crate::core::BrokerError;
use crate::core::channel::ChannelRegistry;
use crate::core::identity::ConnectionHooks;
use crate::core::origin::OriginPolicy;
use crate::core::pubsub::{Broadcaster, ControlMessage, internal_stream};
use crate::core::runtime::{EventLoop, WorkerPool};
use crate::core::transport::HandshakeRequest;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// The central struct holding all shared, broker-wide state.
/// Wrapped in an `Arc` and handed to every connection and background task.
pub struct BrokerState {
    /// The configuration the broker was started with.
    pub config: Arc<Config>,
    /// Every live (authorized, welcomed) connection, keyed by session id.
    pub connections: DashMap<u64, Arc<Connection>>,
    /// The broadcasting table.
    pub streams: Broadcaster,
    /// Application channel types, by name.
    pub channels: ChannelRegistry,
    /// The application's connect and disconnect callbacks.
    pub hooks: Arc<dyn ConnectionHooks>,
    pub origin_policy: OriginPolicy,
    /// Log tags resolved for each connection at handshake time.
    pub log_tags: RwLock<Vec<LogTag>>,
    /// The I/O threads every socket is attached to.
    pub event_loop: EventLoop,
    /// The bounded pool running every channel and hook callback.
    pub worker_pool: WorkerPool,
    pub stats: StatsState,
    next_connection_id: AtomicU64,
}

impl BrokerState {
    /// Builds the broker state from a validated configuration. Worker lanes are
    /// spawned on the runtime this is called from.
    pub fn initialize(
        config: Config,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<Arc<Self>, BrokerError> {
        let handle = Handle::try_current()
            .map_err(|e| BrokerError::Internal(format!("no tokio runtime available: {e}")))?;

        let origin_policy = OriginPolicy::new(
            &config.allowed_request_origins,
            config.disable_request_forgery_protection,
            config.allow_same_origin_as_host,
        )?;
        let log_tags: Vec<LogTag> = config.log_tags.iter().map(|t| LogTag::parse(t)).collect();

        let state = Arc::new(Self {
            connections: DashMap::new(),
            streams: Broadcaster::new(),
            channels: ChannelRegistry::new(),
            hooks,
            origin_policy,
            log_tags: RwLock::new(log_tags),
            event_loop: EventLoop::new(config.event_loop_threads),
            worker_pool: WorkerPool::new(config.worker_pool_size, handle),
            stats: StatsState::new(),
            next_connection_id: AtomicU64::new(1),
            config: Arc::new(config),
        });
        Ok(state)
    }

    /// Appends a log tag after the configured ones. Applies to connections
    /// accepted from now on.
    pub fn add_log_tag(&self, tag: LogTag) {
        self.log_tags.write().push(tag);
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Checks an upgrade request before the handshake completes: the path must
    /// match the mount path and the origin must be allowed.
    pub fn validate_handshake(&self, request: &HandshakeRequest) -> Result<(), BrokerError> {
        if request.path.trim_end_matches('/') != self.config.mount_path.trim_end_matches('/') {
            return Err(BrokerError::InvalidPath(request.path.clone()));
        }
        self.origin_policy.check(request)
    }

    /// Publishes `payload` to every subscriber of `stream`.
    pub fn broadcast(&self, stream: &str, payload: Value) -> usize {
        self.streams.publish(stream, payload)
    }

    /// Asks every connection identified by `identifier` to disconnect. Returns
    /// the number of connections the request was scheduled for.
    pub fn remote_disconnect(&self, identifier: &str, reconnect: bool) -> usize {
        let message = ControlMessage::Disconnect { reconnect };
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Could not encode control message: {}", e);
                return 0;
            }
        };
        let scheduled = self.streams.publish(&internal_stream(identifier), payload);
        info!(
            "Remote disconnect for '{}' scheduled on {} connections.",
            identifier, scheduled
        );
        scheduled
    }

    /// The live connections whose canonical identifier equals `identifier`.
    pub fn connections_for(&self, identifier: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().identifier() == identifier)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends a heartbeat to every live connection.
    pub fn beat_all(&self) {
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in live {
            connection.beat();
        }
    }

    /// Tells every live client the server is restarting and closes its socket.
    pub fn restart_all(&self) -> usize {
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in &live {
            connection.close_for_restart();
        }
        live.len()
    }
}
