// src/core/identity.rs

//! Who is on the other end of a connection, and the application hooks that decide it.

use crate::core::transport::HandshakeRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The identifying fields a connect hook attaches to a connection, e.g.
/// `current_user = "42"`. Fields are kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionIdentity {
    fields: BTreeMap<String, String>,
}

impl ConnectionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The canonical identifier: every field value, sorted, joined with `:`.
    /// Empty for an anonymous connection.
    pub fn identifier(&self) -> String {
        let mut values: Vec<&str> = self.fields.values().map(String::as_str).collect();
        values.sort_unstable();
        values.join(":")
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// The outcome of a connect hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectResult {
    Authorized(ConnectionIdentity),
    Rejected(String),
}

/// Application callbacks around a connection's lifetime. Both run on the
/// connection's worker lane.
pub trait ConnectionHooks: Send + Sync + 'static {
    /// Authenticates the upgrade request. The default accepts everyone anonymously.
    fn connect(&self, _request: &HandshakeRequest) -> ConnectResult {
        ConnectResult::Authorized(ConnectionIdentity::new())
    }

    /// Runs once after every subscription of an authorized connection has been torn down.
    fn disconnect(&self, _identity: &ConnectionIdentity) {}
}

/// Accepts every connection with an empty identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousHooks;

impl ConnectionHooks for AnonymousHooks {}
