// src/core/pubsub/mod.rs

//! Named broadcastings and the connections streaming from them.
//!
//! A broadcasting is registered by a channel through `stream_from` and fed by the
//! application through [`Broadcaster::publish`]. Registrant lists are copy-on-write,
//! so a publish works on a stable snapshot while subscriptions come and go.

use crate::core::metrics;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub mod remote;

pub use remote::{ControlMessage, internal_stream};

/// Called once per publish with the shared payload. Implementations only schedule
/// work; the actual handler runs on the owner's worker lane.
pub type Delivery = Arc<dyn Fn(Arc<Value>) + Send + Sync>;

/// Who a registration belongs to: one subscription of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamOwner {
    pub connection_id: u64,
    pub channel_key: String,
}

impl StreamOwner {
    pub fn new(connection_id: u64, channel_key: impl Into<String>) -> Self {
        Self {
            connection_id,
            channel_key: channel_key.into(),
        }
    }
}

#[derive(Clone)]
struct Registration {
    owner: StreamOwner,
    deliver: Delivery,
}

/// The process-wide broadcasting table.
#[derive(Default)]
pub struct Broadcaster {
    /// A map from a broadcasting name to its registrants, in registration order.
    streams: DashMap<String, Arc<Vec<Registration>>>,
    /// Reverse index: connection id to the (channel key, broadcasting) pairs it holds.
    owners: DashMap<u64, HashSet<(String, String)>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `owner` on broadcasting `name`. An owner holds at most one
    /// registration per broadcasting; registering again replaces the handler.
    pub fn add(&self, owner: StreamOwner, name: &str, deliver: Delivery) {
        {
            let mut entry = self.streams.entry(name.to_string()).or_default();
            let mut next: Vec<Registration> = entry
                .iter()
                .filter(|r| r.owner != owner)
                .cloned()
                .collect();
            next.push(Registration {
                owner: owner.clone(),
                deliver,
            });
            *entry = Arc::new(next);
        }
        self.owners
            .entry(owner.connection_id)
            .or_default()
            .insert((owner.channel_key, name.to_string()));
        metrics::ACTIVE_STREAMS.set(self.streams.len() as f64);
    }

    /// Removes `owner`'s registration on `name`. Returns false if there was none.
    pub fn remove(&self, owner: &StreamOwner, name: &str) -> bool {
        let removed = self.detach(owner, name);
        if let Some(mut held) = self.owners.get_mut(&owner.connection_id) {
            held.remove(&(owner.channel_key.clone(), name.to_string()));
        }
        self.owners
            .remove_if(&owner.connection_id, |_, held| held.is_empty());
        removed
    }

    /// Removes every registration held by one subscription. Returns how many were removed.
    pub fn remove_all(&self, owner: &StreamOwner) -> usize {
        let names: Vec<String> = match self.owners.get_mut(&owner.connection_id) {
            Some(mut held) => {
                let names = held
                    .iter()
                    .filter(|(key, _)| *key == owner.channel_key)
                    .map(|(_, name)| name.clone())
                    .collect::<Vec<_>>();
                held.retain(|(key, _)| *key != owner.channel_key);
                names
            }
            None => return 0,
        };
        self.owners
            .remove_if(&owner.connection_id, |_, held| held.is_empty());
        names
            .iter()
            .filter(|name| self.detach(owner, name))
            .count()
    }

    /// Removes every registration of every subscription of one connection.
    pub fn remove_connection(&self, connection_id: u64) -> usize {
        let Some((_, held)) = self.owners.remove(&connection_id) else {
            return 0;
        };
        held.into_iter()
            .filter(|(key, name)| self.detach(&StreamOwner::new(connection_id, key.clone()), name))
            .count()
    }

    fn detach(&self, owner: &StreamOwner, name: &str) -> bool {
        let removed = match self.streams.get_mut(name) {
            Some(mut entry) => {
                let before = entry.len();
                let next: Vec<Registration> = entry
                    .iter()
                    .filter(|r| r.owner != *owner)
                    .cloned()
                    .collect();
                let removed = next.len() != before;
                if removed {
                    *entry = Arc::new(next);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.streams.remove_if(name, |_, list| list.is_empty());
            metrics::ACTIVE_STREAMS.set(self.streams.len() as f64);
        }
        removed
    }

    /// Hands `payload` to every registrant of `name` as of this call. Each
    /// registrant is scheduled at most once. Returns the number scheduled.
    pub fn publish(&self, name: &str, payload: Value) -> usize {
        metrics::BROADCASTS_TOTAL.inc();
        let Some(snapshot) = self.streams.get(name).map(|entry| entry.value().clone()) else {
            debug!("Broadcasting to '{}' reached no subscribers.", name);
            return 0;
        };

        let payload = Arc::new(payload);
        for registration in snapshot.iter() {
            (registration.deliver)(payload.clone());
        }
        debug!(
            "Broadcasting to '{}' scheduled for {} subscribers.",
            name,
            snapshot.len()
        );
        snapshot.len()
    }

    /// Returns a list of every broadcasting with at least one registrant.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.streams.get(name).map_or(0, |list| list.len())
    }

    /// The broadcastings held by one subscription.
    pub fn streams_of(&self, owner: &StreamOwner) -> Vec<String> {
        self.owners
            .get(&owner.connection_id)
            .map(|held| {
                held.iter()
                    .filter(|(key, _)| *key == owner.channel_key)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
