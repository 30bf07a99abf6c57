// src/core/origin.rs

//! Cross-site WebSocket hijacking protection: which `Origin` headers may open a socket.

use crate::core::BrokerError;
use crate::core::transport::HandshakeRequest;
use regex::Regex;
use wildmatch::WildMatch;

/// One entry of the origin allow-list.
#[derive(Debug, Clone)]
pub enum OriginRule {
    Exact(String),
    /// Written as `/pattern/` in configuration.
    Pattern(Regex),
    /// Any entry containing `*` or `?`.
    Glob(WildMatch),
}

impl OriginRule {
    pub fn parse(entry: &str) -> Result<Self, BrokerError> {
        if entry.len() >= 2 && entry.starts_with('/') && entry.ends_with('/') {
            let pattern = &entry[1..entry.len() - 1];
            // Anchored so `/example\.com/` cannot match `evil-example.com.attacker`.
            let anchored = format!("^(?:{pattern})$");
            return Regex::new(&anchored).map(OriginRule::Pattern).map_err(|e| {
                BrokerError::Internal(format!("invalid origin pattern '{entry}': {e}"))
            });
        }
        if entry.contains('*') || entry.contains('?') {
            return Ok(OriginRule::Glob(WildMatch::new(entry)));
        }
        Ok(OriginRule::Exact(entry.to_string()))
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            OriginRule::Exact(allowed) => allowed == origin,
            OriginRule::Pattern(re) => re.is_match(origin),
            OriginRule::Glob(glob) => glob.matches(origin),
        }
    }
}

/// The evaluated origin settings of a server.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    rules: Vec<OriginRule>,
    disabled: bool,
    allow_same_origin_as_host: bool,
}

impl OriginPolicy {
    pub fn new(
        allowed: &[String],
        disable_request_forgery_protection: bool,
        allow_same_origin_as_host: bool,
    ) -> Result<Self, BrokerError> {
        let rules = allowed
            .iter()
            .map(|entry| OriginRule::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            disabled: disable_request_forgery_protection,
            allow_same_origin_as_host,
        })
    }

    /// A policy that lets every request through.
    pub fn permissive() -> Self {
        Self {
            rules: Vec::new(),
            disabled: true,
            allow_same_origin_as_host: true,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Decides whether `request` may be upgraded. Requests without an `Origin`
    /// header are refused unless protection is disabled.
    pub fn check(&self, request: &HandshakeRequest) -> Result<(), BrokerError> {
        if self.disabled {
            return Ok(());
        }
        let Some(origin) = request.origin() else {
            return Err(BrokerError::ForbiddenOrigin("(none)".into()));
        };

        if self.rules.iter().any(|rule| rule.matches(origin)) {
            return Ok(());
        }
        if self.allow_same_origin_as_host
            && let Some(host) = request.host()
            && origin == format!("{}://{}", request.scheme(), host)
        {
            return Ok(());
        }
        Err(BrokerError::ForbiddenOrigin(origin.to_string()))
    }
}
