// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for per-socket resource management.

use crate::core::metrics;
use crate::core::state::BrokerState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Releases everything a socket holds at the transport level when its driver
/// exits, however it exits.
pub struct ConnectionGuard {
    state: Arc<BrokerState>,
    session_id: u64,
    addr: SocketAddr,
    /// The `max_clients` slot held by this socket.
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub(crate) fn new(
        state: Arc<BrokerState>,
        session_id: u64,
        addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        metrics::CONNECTED_CLIENTS.inc();
        Self {
            state,
            session_id,
            addr,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping, releasing socket {} from {}",
            self.session_id, self.addr
        );
        // Frees the event loop registration; a no-op if teardown already did it.
        self.state.event_loop.detach(self.session_id);
    }
}
