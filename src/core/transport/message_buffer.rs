// src/core/transport/message_buffer.rs

//! Holds inbound frames until a connection has finished opening, then replays
//! them in arrival order.

use super::frame_socket::Frame;
use crate::core::BrokerError;
use parking_lot::Mutex;
use std::collections::VecDeque;

struct BufferState {
    processing: bool,
    queue: VecDeque<String>,
}

/// A per-connection FIFO in front of the command dispatcher.
///
/// The dispatch callback is invoked while the buffer's lock is held, which is what
/// keeps replayed frames ahead of frames appended concurrently with
/// [`mark_ready`](Self::mark_ready). It must therefore be short and must never
/// call back into the buffer.
pub struct MessageBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    dispatch: Box<dyn Fn(String) + Send + Sync>,
}

impl MessageBuffer {
    /// Creates a buffer that holds at most `capacity` frames while not ready.
    pub fn new<F>(capacity: usize, dispatch: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(BufferState {
                processing: false,
                queue: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            dispatch: Box::new(dispatch),
        }
    }

    /// Accepts one frame. Text frames are queued while not ready and dispatched
    /// immediately afterwards. Non-text frames are rejected and dropped.
    pub fn append(&self, frame: Frame) -> Result<(), BrokerError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                return Err(BrokerError::NonTextFrame(format!(
                    "binary frame of {} bytes",
                    data.len()
                )));
            }
        };

        let mut state = self.state.lock();
        if state.processing {
            (self.dispatch)(text);
            return Ok(());
        }
        if state.queue.len() >= self.capacity {
            return Err(BrokerError::BufferOverflow(self.capacity));
        }
        state.queue.push_back(text);
        Ok(())
    }

    /// Switches to processing mode and drains everything buffered so far, in
    /// order, before returning. Only the first call has any effect.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if state.processing {
            return;
        }
        state.processing = true;
        while let Some(text) = state.queue.pop_front() {
            (self.dispatch)(text);
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    /// The number of frames waiting for [`mark_ready`](Self::mark_ready).
    pub fn buffered(&self) -> usize {
        self.state.lock().queue.len()
    }
}
