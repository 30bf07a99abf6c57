// src/core/transport/frame_socket.rs

//! One WebSocket endpoint: the upgrade handshake, framing, and a small event
//! surface that the owning connection listens to.

use super::request::HandshakeRequest;
use crate::core::BrokerError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Weak;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const REJECTION_BODY: &str = "Failed to upgrade to WebSocket";

/// An inbound data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Receives the events of one [`FrameSocket`].
///
/// `on_open` fires once, `on_message` any number of times while the socket is
/// open, and `on_close` exactly once. `on_error` may precede `on_close`.
pub trait SocketListener: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, frame: Frame);
    fn on_close(&self, code: u16, reason: &str);
    fn on_error(&self, error: &BrokerError);
}

/// Work queued for the writer half of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Message),
    Close { code: u16, reason: String },
}

/// The receiving end of a socket's write queue. Drained by [`FrameSocket::serve`].
pub type Outbox = mpsc::UnboundedReceiver<Outgoing>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for SocketState {
    fn from(value: u8) -> Self {
        match value {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

/// The write side and event source of one WebSocket.
///
/// Writes from any thread are queued on an unbounded outbox and performed by the
/// single writer running in [`serve`](Self::serve), so frames never interleave.
pub struct FrameSocket {
    id: u64,
    state: AtomicU8,
    outbox: mpsc::UnboundedSender<Outgoing>,
    outstanding_pings: AtomicU32,
    max_missed_pongs: u32,
    /// Frames queued on the outbox and not yet written.
    queued: AtomicUsize,
    max_queued_frames: usize,
    listener: Weak<dyn SocketListener>,
}

impl FrameSocket {
    pub fn new(
        id: u64,
        max_missed_pongs: u32,
        max_queued_frames: usize,
        listener: Weak<dyn SocketListener>,
    ) -> (Self, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::with_outbox(id, max_missed_pongs, max_queued_frames, listener, tx),
            rx,
        )
    }

    /// Like [`new`](Self::new), for callers that create the write queue themselves.
    pub fn with_outbox(
        id: u64,
        max_missed_pongs: u32,
        max_queued_frames: usize,
        listener: Weak<dyn SocketListener>,
        outbox: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self {
            id,
            state: AtomicU8::new(SocketState::Connecting as u8),
            outbox,
            outstanding_pings: AtomicU32::new(0),
            max_missed_pongs: max_missed_pongs.max(1),
            queued: AtomicUsize::new(0),
            max_queued_frames: max_queued_frames.max(1),
            listener,
        }
    }

    /// Performs the server side of the WebSocket upgrade. `validate` sees the
    /// parsed request before the 101 response is written; if it fails, the
    /// client gets a fixed HTTP error response and the error is returned.
    pub async fn accept<F>(
        stream: TcpStream,
        remote_addr: SocketAddr,
        validate: F,
    ) -> Result<(WebSocketStream<TcpStream>, HandshakeRequest), BrokerError>
    where
        F: FnOnce(&HandshakeRequest) -> Result<(), BrokerError> + Unpin,
    {
        let mut verdict: Option<Result<HandshakeRequest, BrokerError>> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let parsed = HandshakeRequest::from_http(request, remote_addr);
            match validate(&parsed) {
                Ok(()) => {
                    verdict = Some(Ok(parsed));
                    Ok(response)
                }
                Err(e) => {
                    let rejection = rejection_response(&e);
                    verdict = Some(Err(e));
                    Err(rejection)
                }
            }
        };

        let upgraded = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await;

        match (upgraded, verdict) {
            (_, Some(Err(e))) => Err(e),
            (Ok(Ok(ws)), Some(Ok(request))) => Ok((ws, request)),
            (Ok(Err(e)), _) => Err(BrokerError::Handshake(e.to_string())),
            (Err(_), _) => Err(BrokerError::Handshake("handshake timed out".into())),
            (Ok(Ok(_)), None) => Err(BrokerError::Internal(
                "handshake completed without a request".into(),
            )),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SocketState {
        SocketState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Queues one text frame.
    pub fn send(&self, text: String) -> Result<(), BrokerError> {
        match self.state() {
            SocketState::Connecting | SocketState::Open => self.enqueue(Message::text(text)),
            SocketState::Closing | SocketState::Closed => Err(BrokerError::ConnectionClosed),
        }
    }

    /// Starts the closing handshake. Only the first call has any effect.
    pub fn close(&self, code: u16, reason: &str) {
        let began = [SocketState::Connecting, SocketState::Open]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        from as u8,
                        SocketState::Closing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            });
        if !began {
            return;
        }
        debug!("Closing socket {} ({} {}).", self.id, code, reason);
        if self
            .outbox
            .send(Outgoing::Close {
                code,
                reason: reason.to_string(),
            })
            .is_err()
        {
            // No writer left to run the handshake; finish the close here.
            self.emit_close(code, reason);
        }
    }

    /// Sends a protocol ping. Once `max_missed_pongs` pings in a row go
    /// unanswered the socket is closed instead.
    pub fn ping(&self) -> Result<(), BrokerError> {
        let outstanding = self.outstanding_pings.fetch_add(1, Ordering::AcqRel);
        if outstanding >= self.max_missed_pongs {
            warn!(
                "Socket {} missed {} pongs in a row; closing.",
                self.id, outstanding
            );
            self.close(CLOSE_INTERNAL_ERROR, "ping timeout");
            return Err(BrokerError::ConnectionClosed);
        }
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }
        self.enqueue(Message::Ping(Bytes::new()))
    }

    /// Pings sent since the last pong.
    pub fn outstanding_pings(&self) -> u32 {
        self.outstanding_pings.load(Ordering::Acquire)
    }

    /// Frames waiting for the writer.
    pub fn queued_frames(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Queues one frame for the writer. A client that falls more than
    /// `max_queued_frames` frames behind is closed with 1008.
    fn enqueue(&self, message: Message) -> Result<(), BrokerError> {
        let queued = self.queued.fetch_add(1, Ordering::AcqRel);
        if queued >= self.max_queued_frames {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            warn!(
                "Socket {} has {} frames waiting to be written; closing.",
                self.id, queued
            );
            self.close(CLOSE_POLICY_VIOLATION, "outbox overflow");
            return Err(BrokerError::OutboxOverflow(self.max_queued_frames));
        }
        if self.outbox.send(Outgoing::Frame(message)).is_ok() {
            return Ok(());
        }
        self.queued.fetch_sub(1, Ordering::AcqRel);
        let error = BrokerError::ConnectionClosed;
        self.emit_error(&error);
        self.emit_close(CLOSE_ABNORMAL, "write refused");
        Err(error)
    }

    pub fn emit_open(&self) {
        if self
            .state
            .compare_exchange(
                SocketState::Connecting as u8,
                SocketState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            && let Some(listener) = self.listener.upgrade()
        {
            listener.on_open();
        }
    }

    pub fn emit_message(&self, frame: Frame) {
        if self.state() != SocketState::Open {
            return;
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.on_message(frame);
        }
    }

    pub fn emit_pong(&self) {
        self.outstanding_pings.store(0, Ordering::Release);
    }

    pub fn emit_error(&self, error: &BrokerError) {
        if self.state() == SocketState::Closed {
            return;
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.on_error(error);
        }
    }

    pub fn emit_close(&self, code: u16, reason: &str) {
        let previous = self
            .state
            .swap(SocketState::Closed as u8, Ordering::AcqRel);
        if SocketState::from(previous) == SocketState::Closed {
            return;
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.on_close(code, reason);
        }
    }

    /// Pumps frames between the WebSocket and the listener until either side
    /// closes or `cancel` fires. Always ends with exactly one `on_close`.
    pub async fn serve(
        &self,
        ws: WebSocketStream<TcpStream>,
        mut outbox: Outbox,
        cancel: CancellationToken,
    ) {
        let (mut sink, mut stream) = ws.split();
        let mut close_code = CLOSE_ABNORMAL;
        let mut close_reason = String::new();

        self.emit_open();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    close_code = CLOSE_GOING_AWAY;
                    close_reason = "server shutting down".to_string();
                    // Frames queued before the cancel, such as a restart notice, still go out.
                    while let Ok(Outgoing::Frame(message)) = outbox.try_recv() {
                        self.queued.fetch_sub(1, Ordering::AcqRel);
                        if sink.feed(message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code.into(),
                            reason: close_reason.clone().into(),
                        })))
                        .await;
                    break;
                }

                outgoing = outbox.recv() => match outgoing {
                    Some(Outgoing::Frame(message)) => {
                        self.queued.fetch_sub(1, Ordering::AcqRel);
                        if let Err(e) = sink.send(message).await {
                            let error = BrokerError::from(e);
                            if !error.is_normal_disconnect() {
                                self.emit_error(&error);
                            }
                            break;
                        }
                    }
                    Some(Outgoing::Close { code, reason }) => {
                        close_code = code;
                        close_reason = reason.clone();
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: code.into(),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },

                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.emit_message(Frame::Text(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(data))) => self.emit_message(Frame::Binary(data)),
                    Some(Ok(Message::Pong(_))) => self.emit_pong(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) => {
                                close_code = frame.code.into();
                                close_reason = frame.reason.as_str().to_owned();
                            }
                            None => close_code = CLOSE_NO_STATUS,
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        let error = BrokerError::from(e);
                        if !error.is_normal_disconnect() {
                            self.emit_error(&error);
                        }
                        break;
                    }
                    None => break,
                },
            }
        }

        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close())
            .await
            .is_err()
        {
            debug!("Socket {} did not flush its close frame in time.", self.id);
        }
        self.emit_close(close_code, &close_reason);
    }
}

fn rejection_response(error: &BrokerError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(REJECTION_BODY.to_string()));
    *response.status_mut() = match error {
        BrokerError::ForbiddenOrigin(_) => StatusCode::FORBIDDEN,
        BrokerError::InvalidPath(_) => StatusCode::NOT_FOUND,
        BrokerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    };
    response
}
