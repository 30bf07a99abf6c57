// src/core/protocol/message.rs

//! Outbound messages written to a single client.

use serde_json::{Value, json};

/// Why the server is asking the client to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unauthorized,
    InvalidRequest,
    ServerRestart,
    Remote,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Unauthorized => "unauthorized",
            DisconnectReason::InvalidRequest => "invalid_request",
            DisconnectReason::ServerRestart => "server_restart",
            DisconnectReason::Remote => "remote",
        }
    }
}

/// Every frame the broker itself emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Welcome,
    Ping(i64),
    ConfirmSubscription(Value),
    RejectSubscription(Value),
    /// A channel push: `{identifier, message}`.
    Message { identifier: Value, message: Value },
    Disconnect {
        reason: DisconnectReason,
        reconnect: bool,
    },
}

impl ServerMessage {
    pub fn to_value(&self) -> Value {
        match self {
            ServerMessage::Welcome => json!({ "type": "welcome" }),
            ServerMessage::Ping(at) => json!({ "type": "ping", "message": at }),
            ServerMessage::ConfirmSubscription(identifier) => {
                json!({ "identifier": identifier, "type": "confirm_subscription" })
            }
            ServerMessage::RejectSubscription(identifier) => {
                json!({ "identifier": identifier, "type": "reject_subscription" })
            }
            ServerMessage::Message {
                identifier,
                message,
            } => json!({ "identifier": identifier, "message": message }),
            ServerMessage::Disconnect { reason, reconnect } => json!({
                "type": "disconnect",
                "reason": reason.as_str(),
                "reconnect": reconnect,
            }),
        }
    }

    /// Serializes the message into the text of one frame.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}
