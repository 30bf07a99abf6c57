// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a client socket,
//! from the WebSocket upgrade to the final close frame.

use super::core::Connection;
use super::guard::ConnectionGuard;
use crate::core::runtime::StreamDriver;
use crate::core::state::BrokerState;
use crate::core::transport::FrameSocket;
use crate::core::{BrokerError, metrics};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Drives one accepted TCP stream on its event-loop thread.
pub struct ConnectionHandler {
    state: Arc<BrokerState>,
    session_id: u64,
    addr: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionHandler {
    pub fn new(
        state: Arc<BrokerState>,
        session_id: u64,
        addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            state,
            session_id,
            addr,
            permit,
        }
    }
}

#[async_trait]
impl StreamDriver for ConnectionHandler {
    async fn drive(self: Box<Self>, stream: TcpStream, cancel: CancellationToken) {
        let ConnectionHandler {
            state,
            session_id,
            addr,
            permit,
        } = *self;
        let _guard = ConnectionGuard::new(state.clone(), session_id, addr, permit);

        let validator = state.clone();
        let upgraded = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Socket {} from {} cancelled during handshake.", session_id, addr);
                return;
            }
            result = FrameSocket::accept(stream, addr, move |request| validator.validate_handshake(request)) => result,
        };

        let (ws, request) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(e) => {
                let reason = match &e {
                    BrokerError::ForbiddenOrigin(_) => "origin",
                    BrokerError::InvalidPath(_) => "path",
                    _ => "handshake",
                };
                state.stats.increment_rejected_connections();
                metrics::CONNECTIONS_REJECTED_TOTAL
                    .with_label_values(&[reason])
                    .inc();
                warn!("Rejected WebSocket upgrade from {}: {}", addr, e);
                return;
            }
        };

        debug!(
            "Started GET \"{}\" [WebSocket] for {} (socket {})",
            request.path,
            addr.ip(),
            session_id
        );
        let (connection, outbox) = Connection::new(state, session_id, request);
        connection.socket().serve(ws, outbox, cancel).await;
    }
}
