// src/core/transport/request.rs

//! The parts of the HTTP upgrade request that outlive the handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::http;
use uuid::Uuid;

/// A snapshot of the upgrade request, handed to the origin check, log tags,
/// and the application's connect hook.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub remote_addr: SocketAddr,
    pub path: String,
    pub query: Option<String>,
    /// Header names are stored lower-cased.
    pub headers: HashMap<String, String>,
    /// Taken from `X-Request-Id` when present, otherwise generated.
    pub request_id: String,
}

impl HandshakeRequest {
    /// Builds a request with no headers. Mostly useful for tests and for
    /// embedding the broker behind another transport.
    pub fn new(remote_addr: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            remote_addr,
            path: path.into(),
            query: None,
            headers: HashMap::new(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        if name.eq_ignore_ascii_case("x-request-id") {
            self.request_id = self.headers["x-request-id"].clone();
        }
        self
    }

    pub fn from_http<B>(request: &http::Request<B>, remote_addr: SocketAddr) -> Self {
        let headers: HashMap<String, String> = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let request_id = headers
            .get("x-request-id")
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            remote_addr,
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            headers,
            request_id,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    pub fn host(&self) -> Option<&str> {
        self.header("x-forwarded-host").or_else(|| self.header("host"))
    }

    /// The scheme the client used to reach us, honouring `X-Forwarded-Proto`.
    pub fn scheme(&self) -> &str {
        self.header("x-forwarded-proto").unwrap_or("http")
    }

    /// Looks up one cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }

    /// Looks up one raw (undecoded) query string parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }
}
