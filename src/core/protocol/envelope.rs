// src/core/protocol/envelope.rs

//! Inbound command envelopes and the decoded channel identifiers they carry.

use crate::core::BrokerError;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The commands a client may issue over its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Message,
}

impl FromStr for CommandKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(CommandKind::Subscribe),
            "unsubscribe" => Ok(CommandKind::Unsubscribe),
            "message" => Ok(CommandKind::Message),
            other => Err(BrokerError::UnknownCommand(other.to_string())),
        }
    }
}

/// One decoded inbound frame: `{command, identifier, data}`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: String,
    /// The identifier exactly as the client sent it (a JSON string or an object).
    pub identifier: Value,
    pub data: Option<Value>,
}

impl CommandEnvelope {
    /// Parses a text frame into an envelope. The frame must be a JSON object
    /// with a string `command` field.
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(BrokerError::Protocol(
                "command envelope must be a JSON object".into(),
            ));
        };

        let command = match fields.remove("command") {
            Some(Value::String(command)) => command,
            Some(_) => {
                return Err(BrokerError::Protocol("'command' must be a string".into()));
            }
            None => return Err(BrokerError::Protocol("missing 'command' field".into())),
        };

        Ok(Self {
            command,
            identifier: fields.remove("identifier").unwrap_or(Value::Null),
            data: fields.remove("data"),
        })
    }

    pub fn kind(&self) -> Result<CommandKind, BrokerError> {
        self.command.parse()
    }

    /// Decodes the identifier into its canonical form.
    pub fn channel_identifier(&self) -> Result<ChannelIdentifier, BrokerError> {
        ChannelIdentifier::decode(&self.identifier)
    }

    /// Decodes the `data` payload of a `message` command into an object.
    pub fn decoded_data(&self) -> Result<Map<String, Value>, BrokerError> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| BrokerError::Protocol("missing 'data' field".into()))?;
        decode_object(data, "data")
    }
}

impl fmt::Display for CommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Map::new();
        fields.insert("command".into(), Value::String(self.command.clone()));
        fields.insert("identifier".into(), self.identifier.clone());
        if let Some(data) = &self.data {
            fields.insert("data".into(), data.clone());
        }
        write!(f, "{}", Value::Object(fields))
    }
}

/// A decoded channel identifier such as `{"channel": "ChatChannel", "room": "42"}`.
///
/// Two identifiers that differ only in key order produce the same [`key`](Self::key).
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIdentifier {
    raw: Value,
    params: Map<String, Value>,
    channel: String,
    key: String,
}

impl ChannelIdentifier {
    pub fn decode(raw: &Value) -> Result<Self, BrokerError> {
        let params = decode_object(raw, "identifier")
            .map_err(|e| BrokerError::InvalidIdentifier(e.to_string()))?;

        let channel = match params.get("channel") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(BrokerError::InvalidIdentifier(format!(
                    "missing 'channel' in {raw}"
                )));
            }
        };

        let key = canonicalize(&Value::Object(params.clone())).to_string();
        Ok(Self {
            raw: raw.clone(),
            params,
            channel,
            key,
        })
    }

    /// The order-insensitive subscription key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The registered channel type name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// The identifier in the form the client sent it; echoed back in every
    /// outbound message for this subscription.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The identifier as text: a string identifier verbatim, an object as compact JSON.
    pub fn raw_text(&self) -> String {
        match &self.raw {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Accepts either a JSON-encoded object string or an inline object.
fn decode_object(value: &Value, field: &str) -> Result<Map<String, Value>, BrokerError> {
    let decoded = match value {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded)?,
        other => other.clone(),
    };
    match decoded {
        Value::Object(map) => Ok(map),
        _ => Err(BrokerError::Protocol(format!(
            "'{field}' needs to be a JSON object"
        ))),
    }
}

/// Rebuilds a value with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
