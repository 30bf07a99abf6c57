// src/server/initialization.rs

//! Handles server initialization, from the validated configuration to a bound
//! listener and a running event loop.

use super::LogReloadHandle;
use super::context::ServerContext;
use crate::config::Config;
use crate::core::identity::ConnectionHooks;
use crate::core::state::BrokerState;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all broker components before starting the main loop.
pub async fn setup(
    config: Config,
    hooks: Arc<dyn ConnectionHooks>,
    log_reload_handle: Option<LogReloadHandle>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = BrokerState::initialize(config, hooks)?;
    state
        .event_loop
        .ensure_started()
        .map_err(|e| anyhow!("Failed to start the event loop: {}", e))?;
    info!("Broker state initialized.");

    let listener = TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(
        "Cableway listening on ws://{}{}",
        listener.local_addr()?,
        state.config.mount_path
    );
    let connection_permits = Arc::new(Semaphore::new(state.config.max_clients));

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        connection_permits,
        heartbeat: None,
        log_reload_handle,
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Event loop threads: {}, worker pool size: {}, max clients: {}.",
        config.event_loop_threads, config.worker_pool_size, config.max_clients
    );
    info!(
        "Heartbeat every {:?}; sockets are dropped after {} missed pongs.",
        config.heartbeat_interval,
        config.max_missed_pongs
    );
    if config.disable_request_forgery_protection {
        warn!("WARNING: Request forgery protection is disabled.");
    } else if !config.allowed_request_origins.is_empty() {
        info!(
            "Allowed request origins: {}",
            config.allowed_request_origins.join(", ")
        );
    }
}
