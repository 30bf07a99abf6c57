// src/connection/session.rs

//! Lifecycle phases of a connection and the snapshot exposed to operators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Handshake complete, socket not yet reported open.
    Connecting,
    /// Socket open, connect hook pending.
    Open,
    /// The connect hook refused the connection.
    Rejected,
    /// Welcomed and accepting commands.
    Live,
    Closing,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Rejected => "rejected",
            ConnectionPhase::Live => "live",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Closed => "closed",
        }
    }

    /// True once teardown has started.
    pub fn is_finished(&self) -> bool {
        matches!(self, ConnectionPhase::Closing | ConnectionPhase::Closed)
    }
}

/// A point-in-time description of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub identifier: String,
    pub remote_addr: SocketAddr,
    pub phase: ConnectionPhase,
    pub started_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    /// The rendered log tags.
    pub tags: String,
}
