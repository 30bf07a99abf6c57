// src/core/errors.rs

//! Defines the primary error type for the entire broker.

use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The main error enum, representing all possible failures within the broker.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Failed to upgrade to WebSocket: {0}")]
    Handshake(String),

    #[error("Request origin not allowed: {0}")]
    ForbiddenOrigin(String),

    #[error("No WebSocket endpoint mounted at '{0}'")]
    InvalidPath(String),

    #[error("Unauthorized connection: {0}")]
    Unauthorized(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Couldn't handle non-string message: {0}")]
    NonTextFrame(String),

    #[error("Message buffer overflow: more than {0} frames received before the connection was ready")]
    BufferOverflow(usize),

    #[error("Outbound queue overflow: more than {0} frames waiting to be written")]
    OutboxOverflow(usize),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Received unrecognized command '{0}'")]
    UnknownCommand(String),

    #[error("Subscription class not found: {0}")]
    ChannelNotFound(String),

    #[error("Unable to find subscription with identifier: {0}")]
    SubscriptionNotFound(String),

    #[error("Unable to process {channel}#{action}")]
    UnknownAction { channel: String, action: String },

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Event loop is shut down")]
    LoopShutdown,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BrokerError {
    fn clone(&self) -> Self {
        match self {
            BrokerError::Io(e) => BrokerError::Io(Arc::clone(e)),
            BrokerError::WebSocket(s) => BrokerError::WebSocket(s.clone()),
            BrokerError::Handshake(s) => BrokerError::Handshake(s.clone()),
            BrokerError::ForbiddenOrigin(s) => BrokerError::ForbiddenOrigin(s.clone()),
            BrokerError::InvalidPath(s) => BrokerError::InvalidPath(s.clone()),
            BrokerError::Unauthorized(s) => BrokerError::Unauthorized(s.clone()),
            BrokerError::Protocol(s) => BrokerError::Protocol(s.clone()),
            BrokerError::NonTextFrame(s) => BrokerError::NonTextFrame(s.clone()),
            BrokerError::BufferOverflow(n) => BrokerError::BufferOverflow(*n),
            BrokerError::OutboxOverflow(n) => BrokerError::OutboxOverflow(*n),
            BrokerError::InvalidIdentifier(s) => BrokerError::InvalidIdentifier(s.clone()),
            BrokerError::UnknownCommand(s) => BrokerError::UnknownCommand(s.clone()),
            BrokerError::ChannelNotFound(s) => BrokerError::ChannelNotFound(s.clone()),
            BrokerError::SubscriptionNotFound(s) => BrokerError::SubscriptionNotFound(s.clone()),
            BrokerError::UnknownAction { channel, action } => BrokerError::UnknownAction {
                channel: channel.clone(),
                action: action.clone(),
            },
            BrokerError::Handler(s) => BrokerError::Handler(s.clone()),
            BrokerError::ConnectionClosed => BrokerError::ConnectionClosed,
            BrokerError::PoolShutdown => BrokerError::PoolShutdown,
            BrokerError::LoopShutdown => BrokerError::LoopShutdown,
            BrokerError::Internal(s) => BrokerError::Internal(s.clone()),
        }
    }
}

impl PartialEq for BrokerError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BrokerError::Io(e1), BrokerError::Io(e2)) => e1.to_string() == e2.to_string(),
            (BrokerError::WebSocket(s1), BrokerError::WebSocket(s2))
            | (BrokerError::Handshake(s1), BrokerError::Handshake(s2))
            | (BrokerError::ForbiddenOrigin(s1), BrokerError::ForbiddenOrigin(s2))
            | (BrokerError::InvalidPath(s1), BrokerError::InvalidPath(s2))
            | (BrokerError::Unauthorized(s1), BrokerError::Unauthorized(s2))
            | (BrokerError::Protocol(s1), BrokerError::Protocol(s2))
            | (BrokerError::NonTextFrame(s1), BrokerError::NonTextFrame(s2))
            | (BrokerError::InvalidIdentifier(s1), BrokerError::InvalidIdentifier(s2))
            | (BrokerError::UnknownCommand(s1), BrokerError::UnknownCommand(s2))
            | (BrokerError::ChannelNotFound(s1), BrokerError::ChannelNotFound(s2))
            | (BrokerError::SubscriptionNotFound(s1), BrokerError::SubscriptionNotFound(s2))
            | (BrokerError::Handler(s1), BrokerError::Handler(s2))
            | (BrokerError::Internal(s1), BrokerError::Internal(s2)) => s1 == s2,
            (BrokerError::BufferOverflow(n1), BrokerError::BufferOverflow(n2))
            | (BrokerError::OutboxOverflow(n1), BrokerError::OutboxOverflow(n2)) => n1 == n2,
            (
                BrokerError::UnknownAction {
                    channel: c1,
                    action: a1,
                },
                BrokerError::UnknownAction {
                    channel: c2,
                    action: a2,
                },
            ) => c1 == c2 && a1 == a2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl BrokerError {
    /// Returns true for transport failures that are part of a normal peer disconnect.
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            BrokerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            BrokerError::ConnectionClosed => true,
            _ => false,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(Arc::new(e))
    }
}

impl From<tungstenite::Error> for BrokerError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(io) => BrokerError::Io(Arc::new(io)),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                BrokerError::ConnectionClosed
            }
            other => BrokerError::WebSocket(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Protocol(format!("JSON decoding error: {e}"))
    }
}

impl From<String> for BrokerError {
    fn from(s: String) -> Self {
        BrokerError::Internal(s)
    }
}
