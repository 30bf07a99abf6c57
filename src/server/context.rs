// src/server/context.rs

use super::LogReloadHandle;
use crate::core::runtime::TimerHandle;
use crate::core::state::BrokerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<BrokerState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// One permit per allowed concurrent socket (`max_clients`).
    pub connection_permits: Arc<Semaphore>,
    /// The server-wide heartbeat timer, once spawned.
    pub heartbeat: Option<TimerHandle>,
    pub log_reload_handle: Option<LogReloadHandle>,
}
