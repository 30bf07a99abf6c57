// src/core/protocol/mod.rs

//! The JSON wire envelope: inbound commands and outbound server messages.

pub mod envelope;
pub mod message;

pub use envelope::{ChannelIdentifier, CommandEnvelope, CommandKind};
pub use message::{DisconnectReason, ServerMessage};
