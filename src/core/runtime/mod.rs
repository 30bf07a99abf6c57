// src/core/runtime/mod.rs

//! Thread topology: event-loop threads for socket I/O and a bounded worker pool
//! for user-level callbacks.

pub mod event_loop;
pub mod worker_pool;

pub use event_loop::{EventLoop, StreamDriver, TimerHandle};
pub use worker_pool::{Job, WorkerLane, WorkerPool, isolate};
