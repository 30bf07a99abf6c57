// src/core/metrics.rs

//! Defines and registers Prometheus metrics for broker monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of sockets currently attached to the event loop.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("cableway_connected_clients", "Number of currently connected sockets.").unwrap();
    /// The number of connections that completed the connect hook and are live.
    pub static ref LIVE_CONNECTIONS: Gauge =
        register_gauge!("cableway_live_connections", "Number of connections in the live state.").unwrap();
    /// The number of broadcasting names with at least one registration.
    pub static ref ACTIVE_STREAMS: Gauge =
        register_gauge!("cableway_active_streams", "Number of broadcasting names with subscribers.").unwrap();

    // --- Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("cableway_connections_received_total", "Total number of connections received.").unwrap();
    /// Rejected connections, labeled by the rejection stage.
    pub static ref CONNECTIONS_REJECTED_TOTAL: CounterVec =
        register_counter_vec!("cableway_connections_rejected_total", "Total number of rejected connections, labeled by reason.", &["reason"]).unwrap();
    /// The total number of client commands dispatched.
    pub static ref COMMANDS_PROCESSED_TOTAL: Counter =
        register_counter!("cableway_commands_processed_total", "Total number of client commands processed.").unwrap();
    /// The total number of publish calls.
    pub static ref BROADCASTS_TOTAL: Counter =
        register_counter!("cableway_broadcasts_total", "Total number of payloads published.").unwrap();
    /// The total number of per-subscriber deliveries scheduled by publish calls.
    pub static ref BROADCAST_DELIVERIES_TOTAL: Counter =
        register_counter!("cableway_broadcast_deliveries_total", "Total number of broadcast payloads handed to subscribers without error.").unwrap();
    /// Failures inside user callbacks, labeled by the dispatch boundary that caught them.
    pub static ref HANDLER_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("cableway_handler_errors_total", "Total number of handler failures, labeled by boundary.", &["boundary"]).unwrap();

    // --- Histograms ---
    /// Time spent running one job on a worker lane.
    pub static ref WORKER_JOB_SECONDS: Histogram =
        register_histogram!("cableway_worker_job_seconds", "Latency of worker pool jobs in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
