// src/config.rs

//! Manages server configuration: loading, resolving derived values, and validation.

use crate::core::origin::OriginRule;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Configuration for the admin HTTP endpoint (metrics, broadcast, remote disconnect).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminConfig {
    /// If true, an HTTP server exposing `/metrics`, `/broadcast` and `/disconnect` is started.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}
fn default_admin_port() -> u16 {
    8879
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_mount_path")]
    mount_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default = "default_event_loop_threads")]
    event_loop_threads: usize,
    #[serde(default = "default_worker_pool_size")]
    worker_pool_size: usize,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    heartbeat_interval: Duration,
    #[serde(default = "default_max_missed_pongs")]
    max_missed_pongs: u32,
    #[serde(default = "default_max_buffered_frames")]
    max_buffered_frames: usize,
    #[serde(default = "default_max_outbound_frames")]
    max_outbound_frames: usize,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    shutdown_timeout: Duration,
    #[serde(default)]
    disable_request_forgery_protection: bool,
    #[serde(default)]
    allowed_request_origins: Vec<String>,
    #[serde(default = "default_allow_same_origin_as_host")]
    allow_same_origin_as_host: bool,
    #[serde(default)]
    log_tags: Vec<String>,
    #[serde(default)]
    admin: AdminConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_mount_path() -> String {
    "/cable".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}
fn default_event_loop_threads() -> usize {
    2
}
fn default_worker_pool_size() -> usize {
    4
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_max_missed_pongs() -> u32 {
    3
}
fn default_max_buffered_frames() -> usize {
    1024
}
fn default_max_outbound_frames() -> usize {
    4096
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_allow_same_origin_as_host() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// The request path WebSocket upgrades are accepted on.
    pub mount_path: String,
    pub log_level: String,
    pub max_clients: usize,
    pub event_loop_threads: usize,
    /// The maximum number of channel callbacks running at the same time.
    pub worker_pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered protocol pings before a socket is dropped.
    pub max_missed_pongs: u32,
    /// Frames a connection may receive before its connect hook has finished.
    pub max_buffered_frames: usize,
    /// Frames that may wait to be written to a slow client before it is dropped.
    pub max_outbound_frames: usize,
    /// How long shutdown waits for worker lanes to drain.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub disable_request_forgery_protection: bool,
    /// Exact origins, `/regex/` patterns, or `*` globs.
    pub allowed_request_origins: Vec<String>,
    pub allow_same_origin_as_host: bool,
    /// `request_id`, `remote_ip`, `path`, `header:<Name>`, `cookie:<name>`,
    /// `query:<name>`, or any literal string.
    pub log_tags: Vec<String>,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mount_path: default_mount_path(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            event_loop_threads: default_event_loop_threads(),
            worker_pool_size: default_worker_pool_size(),
            heartbeat_interval: default_heartbeat_interval(),
            max_missed_pongs: default_max_missed_pongs(),
            max_buffered_frames: default_max_buffered_frames(),
            max_outbound_frames: default_max_outbound_frames(),
            shutdown_timeout: default_shutdown_timeout(),
            disable_request_forgery_protection: false,
            allowed_request_origins: Vec::new(),
            allow_same_origin_as_host: default_allow_same_origin_as_host(),
            log_tags: Vec::new(),
            admin: AdminConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses, resolves and validates a configuration document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            mount_path: normalize_mount_path(&raw_config.mount_path),
            log_level: raw_config.log_level,
            max_clients: raw_config.max_clients,
            event_loop_threads: raw_config.event_loop_threads,
            worker_pool_size: raw_config.worker_pool_size,
            heartbeat_interval: raw_config.heartbeat_interval,
            max_missed_pongs: raw_config.max_missed_pongs,
            max_buffered_frames: raw_config.max_buffered_frames,
            max_outbound_frames: raw_config.max_outbound_frames,
            shutdown_timeout: raw_config.shutdown_timeout,
            disable_request_forgery_protection: raw_config.disable_request_forgery_protection,
            allowed_request_origins: raw_config.allowed_request_origins,
            allow_same_origin_as_host: raw_config.allow_same_origin_as_host,
            log_tags: raw_config.log_tags,
            admin: raw_config.admin,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.event_loop_threads == 0 {
            return Err(anyhow!("event_loop_threads cannot be 0"));
        }
        if self.worker_pool_size == 0 {
            return Err(anyhow!("worker_pool_size cannot be 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat_interval cannot be 0"));
        }
        if self.max_missed_pongs == 0 {
            return Err(anyhow!("max_missed_pongs cannot be 0"));
        }
        if self.max_buffered_frames == 0 {
            return Err(anyhow!("max_buffered_frames cannot be 0"));
        }
        if self.max_outbound_frames == 0 {
            return Err(anyhow!("max_outbound_frames cannot be 0"));
        }
        if !self.mount_path.starts_with('/') {
            return Err(anyhow!("mount_path must start with '/'"));
        }

        for entry in &self.allowed_request_origins {
            OriginRule::parse(entry).map_err(|e| anyhow!("allowed_request_origins: {e}"))?;
        }

        if self.admin.enabled {
            if self.admin.port == 0 {
                return Err(anyhow!("admin.port cannot be 0"));
            }
            if self.admin.port == self.port && self.admin.host == self.host {
                return Err(anyhow!("admin.port must differ from the WebSocket port"));
            }
        }

        if self.disable_request_forgery_protection {
            warn!("Request forgery protection is disabled; any origin may open a connection.");
        } else if self.allowed_request_origins.is_empty() && !self.allow_same_origin_as_host {
            warn!("No request origins are allowed; every WebSocket upgrade will be rejected.");
        }

        Ok(())
    }
}

fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
