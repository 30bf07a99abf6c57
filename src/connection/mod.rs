// src/connection/mod.rs

//! Manages the lifecycle of a single client socket: the upgrade handshake, the
//! connect hook, command dispatch, and teardown.

mod core;
mod guard;
mod handler;
mod session;
mod tags;

pub use self::core::Connection;
pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
pub use session::{ConnectionInfo, ConnectionPhase};
pub use tags::{LogTag, TagFn, render_tags};
