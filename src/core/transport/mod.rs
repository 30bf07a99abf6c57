// src/core/transport/mod.rs

//! The socket layer: WebSocket framing and the pre-open inbound buffer.

pub mod frame_socket;
pub mod message_buffer;
pub mod request;

pub use frame_socket::{Frame, FrameSocket, Outbox, Outgoing, SocketListener, SocketState};
pub use message_buffer::MessageBuffer;
pub use request::HandshakeRequest;
