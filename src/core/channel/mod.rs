// src/core/channel/mod.rs

//! Application channels: the trait they implement, the registry that names them,
//! and the per-connection subscription table that routes commands to them.

use crate::core::BrokerError;
use crate::core::protocol::ChannelIdentifier;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod builtin;
pub mod context;
pub mod subscriptions;

pub use builtin::{PUBSUB_CHANNEL, StreamChannel};
pub use context::{ChannelContext, StreamHandler, Transmitter};
pub use subscriptions::{SubscriptionKeys, Subscriptions};

/// One live subscription's behaviour.
///
/// Every method runs on the owning connection's worker lane, never on an I/O
/// thread, and never concurrently with another method of the same connection.
pub trait Channel: Send + 'static {
    fn subscribed(&mut self, _ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        Ok(())
    }

    fn unsubscribed(&mut self, _ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Handles a client `message` command. `data` is the decoded payload with the
    /// `action` field already removed.
    fn perform(
        &mut self,
        action: &str,
        _data: &Map<String, Value>,
        ctx: &mut ChannelContext,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownAction {
            channel: ctx.identifier().channel().to_string(),
            action: action.to_string(),
        })
    }
}

/// Builds a fresh channel instance for a subscription.
pub type ChannelFactory = Arc<dyn Fn(&ChannelIdentifier) -> Box<dyn Channel> + Send + Sync>;

/// Maps the `channel` field of an identifier to the type that serves it.
#[derive(Default)]
pub struct ChannelRegistry {
    factories: DashMap<String, ChannelFactory>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `factory` under `name`, replacing any previous registration.
    pub fn register<C, F>(&self, name: impl Into<String>, factory: F)
    where
        C: Channel,
        F: Fn(&ChannelIdentifier) -> C + Send + Sync + 'static,
    {
        let factory: ChannelFactory = Arc::new(move |identifier| Box::new(factory(identifier)));
        self.factories.insert(name.into(), factory);
    }

    pub fn lookup(&self, name: &str) -> Option<ChannelFactory> {
        self.factories.get(name).map(|f| f.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
