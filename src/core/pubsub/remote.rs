// src/core/pubsub/remote.rs

//! Control messages sent to a connection through its internal broadcasting.

use serde::{Deserialize, Serialize};

/// The broadcasting every identified connection listens on for control messages.
pub fn internal_stream(identifier: &str) -> String {
    format!("_internal/{identifier}")
}

/// The channel key used for a connection's own internal registration.
pub const INTERNAL_CHANNEL_KEY: &str = "_internal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Ask every connection with the identifier to go away.
    Disconnect {
        #[serde(default = "default_reconnect")]
        reconnect: bool,
    },
}

fn default_reconnect() -> bool {
    true
}
