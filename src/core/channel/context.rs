// src/core/channel/context.rs

//! What a channel instance can do with the connection it lives on.

use crate::connection::Connection;
use crate::core::identity::ConnectionIdentity;
use crate::core::protocol::{ChannelIdentifier, ServerMessage};
use crate::core::pubsub::{Delivery, StreamOwner};
use crate::core::runtime::{TimerHandle, isolate};
use crate::core::state::BrokerState;
use crate::core::{BrokerError, metrics};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error};

/// Handles one broadcast payload for one subscription.
pub type StreamHandler = Arc<dyn Fn(&Value, &Transmitter) -> Result<(), BrokerError> + Send + Sync>;

/// Sends messages to the client on behalf of one subscription. Cheap to clone,
/// and does not keep the connection alive.
#[derive(Clone)]
pub struct Transmitter {
    connection: Weak<Connection>,
    connection_id: u64,
    identifier: Value,
}

impl Transmitter {
    /// Sends `{"identifier": ..., "message": message}` to the client.
    pub fn transmit(&self, message: Value) -> Result<(), BrokerError> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(BrokerError::ConnectionClosed)?;
        connection.transmit(&ServerMessage::Message {
            identifier: self.identifier.clone(),
            message,
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn identifier(&self) -> &Value {
        &self.identifier
    }
}

/// Per-subscription handle given to every [`Channel`](super::Channel) callback.
pub struct ChannelContext {
    connection: Weak<Connection>,
    connection_id: u64,
    state: Arc<BrokerState>,
    identifier: ChannelIdentifier,
    identity: ConnectionIdentity,
    rejected: bool,
    timers: Vec<TimerHandle>,
}

impl ChannelContext {
    pub(crate) fn new(
        connection: Weak<Connection>,
        connection_id: u64,
        state: Arc<BrokerState>,
        identifier: ChannelIdentifier,
        identity: ConnectionIdentity,
    ) -> Self {
        Self {
            connection,
            connection_id,
            state,
            identifier,
            identity,
            rejected: false,
            timers: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &ChannelIdentifier {
        &self.identifier
    }

    /// Every field of the subscription identifier, `channel` included.
    pub fn params(&self) -> &Map<String, Value> {
        self.identifier.params()
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.identifier.param_str(name)
    }

    /// The identity the connect hook assigned to the connection.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn transmitter(&self) -> Transmitter {
        Transmitter {
            connection: self.connection.clone(),
            connection_id: self.connection_id,
            identifier: self.identifier.raw().clone(),
        }
    }

    /// Sends `message` to this subscription's client only.
    pub fn transmit(&self, message: Value) -> Result<(), BrokerError> {
        self.transmitter().transmit(message)
    }

    /// Publishes `payload` on a broadcasting. Returns the number of subscribers
    /// it was scheduled for.
    pub fn broadcast(&self, stream: &str, payload: Value) -> usize {
        self.state.broadcast(stream, payload)
    }

    fn owner(&self) -> StreamOwner {
        StreamOwner::new(self.connection_id, self.identifier.key())
    }

    /// Forwards every payload published on `name` to the client unchanged.
    pub fn stream_from(&mut self, name: &str) -> Result<(), BrokerError> {
        self.stream_from_with(name, |payload, transmitter| {
            transmitter.transmit(payload.clone())
        })
    }

    /// Runs `handler` on the connection's worker lane for every payload
    /// published on `name`.
    pub fn stream_from_with<F>(&mut self, name: &str, handler: F) -> Result<(), BrokerError>
    where
        F: Fn(&Value, &Transmitter) -> Result<(), BrokerError> + Send + Sync + 'static,
    {
        let connection = self
            .connection
            .upgrade()
            .ok_or(BrokerError::ConnectionClosed)?;
        let lane = connection.lane().clone();
        let handler: StreamHandler = Arc::new(handler);
        let transmitter = self.transmitter();
        let stream = name.to_string();

        let deliver: Delivery = Arc::new(move |payload: Arc<Value>| {
            let handler = handler.clone();
            let transmitter = transmitter.clone();
            let stream = stream.clone();
            let posted = lane.post(move || match isolate(|| handler(&payload, &transmitter)) {
                Ok(()) => metrics::BROADCAST_DELIVERIES_TOTAL.inc(),
                Err(e) if e.is_normal_disconnect() => {
                    debug!(
                        "Dropped broadcast on '{}' for closing connection {}.",
                        stream,
                        transmitter.connection_id()
                    );
                }
                Err(e) => {
                    metrics::HANDLER_ERRORS_TOTAL
                        .with_label_values(&["broadcast"])
                        .inc();
                    error!(
                        "Could not deliver broadcast on '{}' to connection {}: {}",
                        stream,
                        transmitter.connection_id(),
                        e
                    );
                }
            });
            if posted.is_err() {
                debug!("Worker lane closed; broadcast delivery skipped.");
            }
        });

        self.state.streams.add(self.owner(), name, deliver);
        debug!(
            "Connection {} is streaming from '{}' for {}.",
            self.connection_id,
            name,
            self.identifier.channel()
        );
        Ok(())
    }

    /// Stops streaming from one broadcasting. Returns false if it was not streamed.
    pub fn stop_stream_from(&mut self, name: &str) -> bool {
        self.state.streams.remove(&self.owner(), name)
    }

    pub fn stop_all_streams(&mut self) -> usize {
        self.state.streams.remove_all(&self.owner())
    }

    /// The broadcastings this subscription currently streams from.
    pub fn streams(&self) -> Vec<String> {
        self.state.streams.streams_of(&self.owner())
    }

    /// Marks the subscription as rejected. Only meaningful inside `subscribed`.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Calls `perform(action)` with empty data every `interval`, on the worker
    /// lane, until the subscription goes away.
    pub fn periodically(&mut self, action: &str, interval: Duration) -> Result<(), BrokerError> {
        let weak = self.connection.clone();
        let key = self.identifier.key().to_string();
        let action = action.to_string();
        let handle = self.state.event_loop.timer(interval, move || {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let target = connection.clone();
            let job_key = key.clone();
            let job_action = action.clone();
            if connection
                .send_async(move || target.run_periodic(&job_key, &job_action))
                .is_err()
            {
                debug!("Periodic '{}' on {} skipped: worker lane closed.", action, key);
            }
        })?;
        self.timers.push(handle);
        Ok(())
    }

    /// The number of live periodic timers.
    pub fn timer_count(&self) -> usize {
        self.timers.iter().filter(|t| !t.is_cancelled()).count()
    }

    /// Stops all streams and timers of this subscription.
    pub(crate) fn teardown(&mut self) {
        self.stop_all_streams();
        for timer in self.timers.drain(..) {
            timer.cancel();
        }
    }
}
