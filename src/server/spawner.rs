// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tracing::info;

/// Starts the heartbeat timer and, if enabled, the admin HTTP server.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    // --- Heartbeat ---
    let weak_state = Arc::downgrade(&ctx.state);
    let heartbeat = ctx
        .state
        .event_loop
        .timer(ctx.state.config.heartbeat_interval, move || {
            if let Some(state) = weak_state.upgrade() {
                state.beat_all();
            }
        })
        .map_err(|e| anyhow!("Failed to start the heartbeat: {}", e))?;
    ctx.heartbeat = Some(heartbeat);

    // --- Admin Server ---
    if ctx.state.config.admin.enabled {
        let admin_state = ctx.state.clone();
        let reload_handle = ctx.log_reload_handle.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_admin_server(admin_state, reload_handle, shutdown_rx).await
        });
    } else {
        info!("Admin HTTP server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
