// src/core/mod.rs

//! The central module containing the broker's protocol, runtime and routing logic.

pub mod channel;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod origin;
pub mod protocol;
pub mod pubsub;
pub mod runtime;
pub mod state;
pub mod transport;

pub use errors::BrokerError;
