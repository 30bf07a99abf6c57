// src/server/metrics_server.rs

//! A small HTTP server for operators: Prometheus metrics, server-side
//! broadcasts, remote disconnects, and a few read-only views of the broker.

use super::LogReloadHandle;
use crate::connection::ConnectionInfo;
use crate::core::metrics::gather_metrics;
use crate::core::state::BrokerState;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AdminState {
    broker: Arc<BrokerState>,
    log_reload_handle: Option<LogReloadHandle>,
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    stream: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    identifier: String,
    #[serde(default = "default_reconnect")]
    reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    filter: String,
}

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Publishes a payload on a broadcasting, as if a channel had called `broadcast`.
async fn broadcast_handler(
    State(admin): State<AdminState>,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    if request.stream.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "stream must not be empty" })),
        );
    }
    let subscribers = admin.broker.broadcast(&request.stream, request.data);
    info!(
        "Admin broadcast on '{}' reached {} subscribers.",
        request.stream, subscribers
    );
    (
        StatusCode::ACCEPTED,
        Json(json!({ "stream": request.stream, "subscribers": subscribers })),
    )
}

/// Disconnects every connection carrying the given identifier.
async fn disconnect_handler(
    State(admin): State<AdminState>,
    Json(request): Json<DisconnectRequest>,
) -> impl IntoResponse {
    let scheduled = admin
        .broker
        .remote_disconnect(&request.identifier, request.reconnect);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "identifier": request.identifier, "scheduled": scheduled })),
    )
}

async fn connections_handler(State(admin): State<AdminState>) -> Json<Vec<ConnectionInfo>> {
    let mut connections: Vec<ConnectionInfo> = admin
        .broker
        .connections
        .iter()
        .map(|entry| entry.value().info())
        .collect();
    connections.sort_by_key(|info| info.id);
    Json(connections)
}

async fn stats_handler(State(admin): State<AdminState>) -> Json<Value> {
    let broker = &admin.broker;
    let mut channels = broker.channels.names();
    channels.sort();
    Json(json!({
        "total_connections": broker.stats.get_total_connections(),
        "rejected_connections": broker.stats.get_rejected_connections(),
        "total_commands": broker.stats.get_total_commands(),
        "live_connections": broker.live_connection_count(),
        "streams": broker.streams.stream_names().len(),
        "worker_pool_size": broker.worker_pool.size(),
        "worker_pool_busy": broker.worker_pool.busy(),
        "event_loop_threads": broker.event_loop.size(),
        "channels": channels,
    }))
}

/// Swaps the active log filter, e.g. `{"filter": "info,cableway::connection=debug"}`.
async fn log_level_handler(
    State(admin): State<AdminState>,
    Json(request): Json<LogLevelRequest>,
) -> impl IntoResponse {
    let Some(handle) = admin.log_reload_handle.as_ref() else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({ "error": "log reloading is not available" })),
        );
    };
    let filter = match EnvFilter::try_new(&request.filter) {
        Ok(filter) => filter,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid filter: {e}") })),
            );
        }
    };
    match handle.reload(filter) {
        Ok(()) => {
            info!("Log filter changed to '{}'.", request.filter);
            (StatusCode::OK, Json(json!({ "filter": request.filter })))
        }
        Err(e) => {
            warn!("Failed to reload log filter: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

fn router(broker: Arc<BrokerState>, log_reload_handle: Option<LogReloadHandle>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/broadcast", post(broadcast_handler))
        .route("/disconnect", post(disconnect_handler))
        .route("/connections", get(connections_handler))
        .route("/stats", get(stats_handler))
        .route("/log-level", put(log_level_handler))
        .with_state(AdminState {
            broker,
            log_reload_handle,
        })
}

/// Runs the admin HTTP server until the shutdown signal fires.
pub async fn run_admin_server(
    state: Arc<BrokerState>,
    log_reload_handle: Option<LogReloadHandle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let host = state.config.admin.host.clone();
    let port = state.config.admin.port;

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind admin server on {host}:{port}"))?;
    info!(
        "Admin server listening on http://{}/metrics",
        listener.local_addr()?
    );

    axum::serve(listener, router(state, log_reload_handle))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Admin server shutting down.");
        })
        .await
        .context("Admin server failed")
}
