// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use crate::connection::ConnectionHandler;
use crate::core::metrics;
use anyhow::{Result, anyhow};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The main server loop that accepts connections and handles graceful shutdown.
/// Returns once a signal arrives, `stop` is cancelled, or a background task fails.
pub async fn run(mut ctx: ServerContext, stop: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = stop.cancelled() => {
                info!("Shutdown requested, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("Accepted new connection from: {}", addr);
                        ctx.state.stats.increment_total_connections();
                        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                        admit(&ctx, socket, addr);
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            },
        }
    }

    shutdown(ctx).await;
    Ok(())
}

/// Takes a `max_clients` slot for the socket and hands it to the event loop.
fn admit(ctx: &ServerContext, socket: TcpStream, addr: std::net::SocketAddr) {
    let Ok(permit) = ctx.connection_permits.clone().try_acquire_owned() else {
        warn!(
            "Rejecting connection from {}: max_clients ({}) reached.",
            addr, ctx.state.config.max_clients
        );
        ctx.state.stats.increment_rejected_connections();
        metrics::CONNECTIONS_REJECTED_TOTAL
            .with_label_values(&["max_clients"])
            .inc();
        return;
    };

    let stream = match socket.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to detach socket from {}: {}", addr, e);
            return;
        }
    };

    let session_id = ctx.state.next_connection_id();
    let handler = ConnectionHandler::new(ctx.state.clone(), session_id, addr, Some(permit));
    if let Err(e) = ctx
        .state
        .event_loop
        .attach(session_id, stream, Box::new(handler))
    {
        error!("Failed to attach connection from {}: {}", addr, e);
    }
}

async fn shutdown(mut ctx: ServerContext) {
    if let Some(heartbeat) = ctx.heartbeat.take() {
        heartbeat.cancel();
    }

    let notified = ctx.state.restart_all();
    info!("Sent restart notices to {} live connections.", notified);

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        debug!("No background task was listening for the shutdown signal.");
    }

    let state = ctx.state.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || state.event_loop.shutdown()).await {
        error!("Event loop shutdown panicked: {e:?}");
    }
    info!("All client sockets closed.");

    let timeout = ctx.state.config.shutdown_timeout;
    if ctx.state.worker_pool.shutdown(timeout).await {
        info!("Worker pool drained.");
    } else {
        warn!(
            "Timed out after {:?} waiting for worker lanes to drain.",
            timeout
        );
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
}
