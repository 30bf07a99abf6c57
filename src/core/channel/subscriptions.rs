// src/core/channel/subscriptions.rs

//! The per-connection table of live channel subscriptions.

use super::{Channel, ChannelContext};
use crate::connection::Connection;
use crate::core::identity::ConnectionIdentity;
use crate::core::protocol::{ChannelIdentifier, CommandEnvelope, CommandKind, ServerMessage};
use crate::core::runtime::isolate;
use crate::core::state::BrokerState;
use crate::core::{BrokerError, metrics};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// A read-only view of the subscribed keys, kept outside the table so it can be
/// read while a channel callback holds the table.
pub type SubscriptionKeys = Arc<RwLock<BTreeSet<String>>>;

struct Subscription {
    channel: Box<dyn Channel>,
    ctx: ChannelContext,
}

/// Maps canonical channel keys to the one live instance serving each.
///
/// Owned by the connection once it is live and only ever touched from the
/// connection's worker lane.
pub struct Subscriptions {
    connection: Weak<Connection>,
    connection_id: u64,
    identity: ConnectionIdentity,
    state: Arc<BrokerState>,
    entries: HashMap<String, Subscription>,
    keys: SubscriptionKeys,
}

impl Subscriptions {
    pub fn new(
        connection: Weak<Connection>,
        connection_id: u64,
        identity: ConnectionIdentity,
        state: Arc<BrokerState>,
        keys: SubscriptionKeys,
    ) -> Self {
        keys.write().clear();
        Self {
            connection,
            connection_id,
            identity,
            state,
            entries: HashMap::new(),
            keys,
        }
    }

    /// Routes one client command. Failures are logged here and never escape.
    pub fn execute(&mut self, envelope: &CommandEnvelope) {
        self.state.stats.increment_total_commands();
        metrics::COMMANDS_PROCESSED_TOTAL.inc();

        let result = isolate(|| match envelope.kind()? {
            CommandKind::Subscribe => self.add(envelope),
            CommandKind::Unsubscribe => self.remove(envelope),
            CommandKind::Message => self.perform(envelope),
        });

        if let Err(e) = result {
            metrics::HANDLER_ERRORS_TOTAL
                .with_label_values(&["command"])
                .inc();
            error!(
                "Could not execute command from ({}) on connection {}: {}",
                envelope, self.connection_id, e
            );
        }
    }

    /// Subscribes to the channel named by the envelope's identifier. Subscribing
    /// to a key that is already live does nothing.
    pub fn add(&mut self, envelope: &CommandEnvelope) -> Result<(), BrokerError> {
        let identifier = envelope.channel_identifier()?;
        if self.entries.contains_key(identifier.key()) {
            debug!(
                "Connection {} is already subscribed to {}.",
                self.connection_id,
                identifier.raw_text()
            );
            return Ok(());
        }

        let factory = self
            .state
            .channels
            .lookup(identifier.channel())
            .ok_or_else(|| BrokerError::ChannelNotFound(identifier.raw_text()))?;

        let key = identifier.key().to_string();
        let raw = identifier.raw().clone();
        let mut channel = factory(&identifier);
        let mut ctx = self.context_for(identifier);

        let outcome = isolate(|| channel.subscribed(&mut ctx));
        if let Err(e) = &outcome {
            metrics::HANDLER_ERRORS_TOTAL
                .with_label_values(&["subscribed"])
                .inc();
            error!(
                "Subscription to {} failed on connection {}: {}",
                ctx.identifier().raw_text(),
                self.connection_id,
                e
            );
        }

        if outcome.is_err() || ctx.is_rejected() {
            info!(
                "{} is transmitting the subscription rejection",
                ctx.identifier().channel()
            );
            Self::teardown(self.connection_id, &mut channel, &mut ctx);
            return self.transmit(&ServerMessage::RejectSubscription(raw));
        }

        info!(
            "{} is transmitting the subscription confirmation",
            ctx.identifier().channel()
        );
        self.keys.write().insert(key.clone());
        self.entries.insert(key, Subscription { channel, ctx });
        self.transmit(&ServerMessage::ConfirmSubscription(raw))
    }

    /// Unsubscribes the identifier named by the envelope.
    pub fn remove(&mut self, envelope: &CommandEnvelope) -> Result<(), BrokerError> {
        let identifier = envelope.channel_identifier()?;
        let Some(mut subscription) = self.entries.remove(identifier.key()) else {
            return Err(BrokerError::SubscriptionNotFound(identifier.raw_text()));
        };
        self.keys.write().remove(identifier.key());
        info!("Unsubscribing from channel: {}", identifier.raw_text());
        Self::teardown(
            self.connection_id,
            &mut subscription.channel,
            &mut subscription.ctx,
        );
        Ok(())
    }

    /// Invokes the action named in the envelope's `data` on its subscription.
    pub fn perform(&mut self, envelope: &CommandEnvelope) -> Result<(), BrokerError> {
        let identifier = envelope.channel_identifier()?;
        let Some(subscription) = self.entries.get_mut(identifier.key()) else {
            return Err(BrokerError::SubscriptionNotFound(identifier.raw_text()));
        };

        let mut data = envelope.decoded_data()?;
        let action = match data.remove("action") {
            Some(Value::String(action)) => action,
            _ => return Err(BrokerError::Protocol("missing 'action' in data".into())),
        };

        let Subscription { channel, ctx } = subscription;
        debug!(
            "{}#{} on connection {}",
            identifier.channel(),
            action,
            self.connection_id
        );
        isolate(|| channel.perform(&action, &data, ctx))
    }

    /// Invokes a periodic action registered through
    /// [`ChannelContext::periodically`]. Missing subscriptions are ignored.
    pub fn run_periodic(&mut self, key: &str, action: &str) {
        let Some(Subscription { channel, ctx }) = self.entries.get_mut(key) else {
            return;
        };
        let data = serde_json::Map::new();
        if let Err(e) = isolate(|| channel.perform(action, &data, ctx)) {
            metrics::HANDLER_ERRORS_TOTAL
                .with_label_values(&["periodic"])
                .inc();
            error!(
                "Periodic action {}#{} failed on connection {}: {}",
                ctx.identifier().channel(),
                action,
                self.connection_id,
                e
            );
        }
    }

    /// Tears down every subscription. Used when the connection closes.
    pub fn unsubscribe_all(&mut self) {
        self.keys.write().clear();
        for (_, mut subscription) in self.entries.drain() {
            Self::teardown(
                self.connection_id,
                &mut subscription.channel,
                &mut subscription.ctx,
            );
        }
    }

    /// The keys of every live subscription.
    pub fn identifiers(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn context_for(&self, identifier: ChannelIdentifier) -> ChannelContext {
        ChannelContext::new(
            self.connection.clone(),
            self.connection_id,
            self.state.clone(),
            identifier,
            self.identity.clone(),
        )
    }

    fn teardown(connection_id: u64, channel: &mut Box<dyn Channel>, ctx: &mut ChannelContext) {
        if let Err(e) = isolate(|| channel.unsubscribed(ctx)) {
            metrics::HANDLER_ERRORS_TOTAL
                .with_label_values(&["unsubscribed"])
                .inc();
            error!(
                "Unsubscribe callback of {} failed on connection {}: {}",
                ctx.identifier().channel(),
                connection_id,
                e
            );
        }
        ctx.teardown();
    }

    fn transmit(&self, message: &ServerMessage) -> Result<(), BrokerError> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(BrokerError::ConnectionClosed)?;
        connection.transmit(message)
    }
}
