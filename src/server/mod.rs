// src/server/mod.rs

use crate::config::Config;
use crate::core::identity::ConnectionHooks;
use crate::core::state::BrokerState;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

/// A handle for swapping the global log filter at run time.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, Registry>>;

/// A bound, not yet running broker.
///
/// Channels are registered on [`Server::state`] between `bind` and `run`.
pub struct Server {
    ctx: context::ServerContext,
    stop: CancellationToken,
}

impl Server {
    /// Initializes the broker state, starts the event loop and binds the listener.
    pub async fn bind(config: Config, hooks: Arc<dyn ConnectionHooks>) -> Result<Self> {
        Self::bind_with_reload(config, hooks, None).await
    }

    pub async fn bind_with_reload(
        config: Config,
        hooks: Arc<dyn ConnectionHooks>,
        log_reload_handle: Option<LogReloadHandle>,
    ) -> Result<Self> {
        let ctx = initialization::setup(config, hooks, log_reload_handle).await?;
        Ok(Self {
            ctx,
            stop: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &Arc<BrokerState> {
        &self.ctx.state
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ctx.listener.local_addr()?)
    }

    /// A token that stops the server gracefully when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Spawns the background tasks and accepts connections until shutdown.
    pub async fn run(mut self) -> Result<()> {
        spawner::spawn_all(&mut self.ctx).await?;
        connection_loop::run(self.ctx, self.stop).await
    }
}

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    hooks: Arc<dyn ConnectionHooks>,
    register_channels: impl FnOnce(&BrokerState),
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    // 1. Initialize broker state, event loop and listener.
    let server = Server::bind_with_reload(config, hooks, Some(log_reload_handle)).await?;

    // 2. Let the application register its channels.
    register_channels(server.state());

    // 3. Spawn background tasks and accept connections until shutdown.
    server.run().await
}
