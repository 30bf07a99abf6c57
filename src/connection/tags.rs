// src/connection/tags.rs

//! Per-connection log tags, resolved once from the upgrade request.

use crate::core::transport::HandshakeRequest;
use std::fmt;
use std::sync::Arc;

/// Computes a tag from the upgrade request.
pub type TagFn = Arc<dyn Fn(&HandshakeRequest) -> String + Send + Sync>;

/// One configured log tag.
#[derive(Clone)]
pub enum LogTag {
    RequestId,
    RemoteIp,
    Path,
    /// `header:<Name>`
    Header(String),
    /// `cookie:<name>`
    Cookie(String),
    /// `query:<name>`
    Query(String),
    Literal(String),
    /// Registered in code through [`BrokerState::add_log_tag`](crate::core::state::BrokerState::add_log_tag).
    Dynamic(TagFn),
}

impl fmt::Debug for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTag::RequestId => write!(f, "RequestId"),
            LogTag::RemoteIp => write!(f, "RemoteIp"),
            LogTag::Path => write!(f, "Path"),
            LogTag::Header(name) => write!(f, "Header({name})"),
            LogTag::Cookie(name) => write!(f, "Cookie({name})"),
            LogTag::Query(name) => write!(f, "Query({name})"),
            LogTag::Literal(text) => write!(f, "Literal({text})"),
            LogTag::Dynamic(_) => write!(f, "Dynamic(<fn>)"),
        }
    }
}

impl LogTag {
    pub fn parse(entry: &str) -> Self {
        match entry {
            "request_id" => LogTag::RequestId,
            "remote_ip" => LogTag::RemoteIp,
            "path" => LogTag::Path,
            other => {
                if let Some(name) = other.strip_prefix("header:") {
                    LogTag::Header(name.trim().to_string())
                } else if let Some(name) = other.strip_prefix("cookie:") {
                    LogTag::Cookie(name.trim().to_string())
                } else if let Some(name) = other.strip_prefix("query:") {
                    LogTag::Query(name.trim().to_string())
                } else {
                    LogTag::Literal(other.to_string())
                }
            }
        }
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&HandshakeRequest) -> String + Send + Sync + 'static,
    {
        LogTag::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, request: &HandshakeRequest) -> String {
        match self {
            LogTag::RequestId => request.request_id.clone(),
            LogTag::RemoteIp => request.remote_addr.ip().to_string(),
            LogTag::Path => request.path.clone(),
            LogTag::Header(name) => request.header(name).unwrap_or("-").to_string(),
            LogTag::Cookie(name) => request.cookie(name).unwrap_or("-").to_string(),
            LogTag::Query(name) => request.query_param(name).unwrap_or("-").to_string(),
            LogTag::Literal(text) => text.clone(),
            LogTag::Dynamic(f) => f(request),
        }
    }
}

/// Renders tags the way they appear in log lines: `[a] [b]`.
pub fn render_tags(tags: &[LogTag], request: &HandshakeRequest) -> String {
    tags.iter()
        .map(|tag| format!("[{}]", tag.resolve(request)))
        .collect::<Vec<_>>()
        .join(" ")
}
