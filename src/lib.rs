// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::connection::LogTag;
pub use crate::core::BrokerError;
pub use crate::core::channel::{Channel, ChannelContext, StreamChannel, PUBSUB_CHANNEL};
pub use crate::core::identity::{ConnectResult, ConnectionHooks, ConnectionIdentity};
pub use crate::server::Server;
