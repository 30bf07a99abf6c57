// src/core/runtime/event_loop.rs

//! A small fixed set of I/O threads that multiplex readiness for every open socket.
//!
//! Each loop thread owns a single-threaded tokio runtime, and therefore exactly one
//! I/O driver (selector). Work reaches a thread only through its task queue, so
//! attaching and detaching a socket are serialized with everything else that
//! thread does. Loop threads run socket drivers and short bookkeeping closures;
//! anything that executes application code belongs on the worker pool.

use crate::core::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopping loop thread waits for its drivers to send close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns a socket once it is attached to a loop thread.
///
/// `drive` runs on the loop thread that received the socket and must return once
/// `cancel` fires.
#[async_trait]
pub trait StreamDriver: Send + 'static {
    async fn drive(self: Box<Self>, stream: TcpStream, cancel: CancellationToken);
}

enum LoopTask {
    Attach {
        id: u64,
        stream: std::net::TcpStream,
        driver: Box<dyn StreamDriver>,
    },
    Detach {
        id: u64,
    },
    Post(Box<dyn FnOnce() + Send>),
    Timer {
        interval: Duration,
        callback: Arc<dyn Fn() + Send + Sync>,
        token: CancellationToken,
    },
}

/// A handle to a repeating timer registered with [`EventLoop::timer`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Stops the timer. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct LoopThread {
    tx: mpsc::UnboundedSender<LoopTask>,
    join: JoinHandle<()>,
}

/// The process-wide set of event-loop threads.
pub struct EventLoop {
    size: usize,
    threads: Mutex<Option<Vec<LoopThread>>>,
    stopped: AtomicBool,
    next_slot: AtomicUsize,
}

impl EventLoop {
    /// Declares an event loop with `size` threads. Threads are started lazily by
    /// [`ensure_started`](Self::ensure_started) or by the first submitted task.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            threads: Mutex::new(None),
            stopped: AtomicBool::new(false),
            next_slot: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.threads.lock().is_some()
    }

    /// Starts the loop threads if they are not running yet. Safe to call from
    /// any thread, any number of times.
    pub fn ensure_started(&self) -> Result<(), BrokerError> {
        let mut threads = self.threads.lock();
        if threads.is_some() {
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::LoopShutdown);
        }

        let mut started = Vec::with_capacity(self.size);
        for index in 0..self.size {
            let (tx, rx) = mpsc::unbounded_channel();
            let join = std::thread::Builder::new()
                .name(format!("cableway-loop-{index}"))
                .spawn(move || run_loop(index, rx))?;
            started.push(LoopThread { tx, join });
        }
        info!("Event loop started with {} threads.", self.size);
        *threads = Some(started);
        Ok(())
    }

    fn submit(&self, slot: usize, task: LoopTask) -> Result<(), BrokerError> {
        self.ensure_started()?;
        let threads = self.threads.lock();
        let Some(threads) = threads.as_ref() else {
            return Err(BrokerError::LoopShutdown);
        };
        threads[slot % threads.len()]
            .tx
            .send(task)
            .map_err(|_| BrokerError::LoopShutdown)
    }

    /// Hands a freshly accepted socket to the loop thread that owns `id`.
    pub fn attach(
        &self,
        id: u64,
        stream: std::net::TcpStream,
        driver: Box<dyn StreamDriver>,
    ) -> Result<(), BrokerError> {
        self.submit(
            id as usize,
            LoopTask::Attach { id, stream, driver },
        )
    }

    /// Cancels the driver registered under `id`. Goes through the same queue as
    /// `attach`, so it can never overtake it. Detaching an unknown or already
    /// detached id is a no-op.
    pub fn detach(&self, id: u64) {
        if self.threads.lock().is_none() {
            return;
        }
        if self.submit(id as usize, LoopTask::Detach { id }).is_err() {
            debug!("Detach of socket {} skipped: event loop is stopped.", id);
        }
    }

    /// Runs a short, non-blocking closure on one of the loop threads.
    pub fn post<F>(&self, task: F) -> Result<(), BrokerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.submit(slot, LoopTask::Post(Box::new(task)))
    }

    /// Calls `callback` on a loop thread every `interval` until the returned
    /// handle is cancelled or the loop shuts down. The first call happens one
    /// full interval after registration.
    pub fn timer<F>(&self, interval: Duration, callback: F) -> Result<TimerHandle, BrokerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(BrokerError::Internal("timer interval must be non-zero".into()));
        }
        let token = CancellationToken::new();
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.submit(
            slot,
            LoopTask::Timer {
                interval,
                callback: Arc::new(callback),
                token: token.clone(),
            },
        )?;
        Ok(TimerHandle { token })
    }

    /// Stops every loop thread and waits for them to exit. Attached drivers are
    /// cancelled and given a short grace period to close their sockets.
    /// Blocks the calling thread.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        for thread in threads {
            drop(thread.tx);
            if thread.join.join().is_err() {
                error!("An event loop thread panicked during shutdown.");
            }
        }
        info!("Event loop stopped.");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Closing the queues is enough for the threads to wind down on their own.
        self.stopped.store(true, Ordering::Release);
        self.threads.get_mut().take();
    }
}

fn run_loop(index: usize, mut rx: mpsc::UnboundedReceiver<LoopTask>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime for event loop thread {}: {}", index, e);
            return;
        }
    };

    runtime.block_on(async move {
        let mut registrations: HashMap<u64, CancellationToken> = HashMap::new();
        let mut timers: Vec<CancellationToken> = Vec::new();
        let mut drivers = JoinSet::new();

        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else { break };
                    match task {
                        LoopTask::Attach { id, stream, driver } => {
                            let stream = match TcpStream::from_std(stream) {
                                Ok(stream) => stream,
                                Err(e) => {
                                    warn!("Failed to register socket {} with loop {}: {}", id, index, e);
                                    continue;
                                }
                            };
                            let token = CancellationToken::new();
                            if let Some(stale) = registrations.insert(id, token.clone()) {
                                stale.cancel();
                            }
                            drivers.spawn(driver.drive(stream, token));
                        }
                        LoopTask::Detach { id } => {
                            if let Some(token) = registrations.remove(&id) {
                                token.cancel();
                            }
                        }
                        LoopTask::Post(task) => task(),
                        LoopTask::Timer { interval, callback, token } => {
                            timers.retain(|t| !t.is_cancelled());
                            timers.push(token.clone());
                            drivers.spawn(run_timer(interval, callback, token));
                        }
                    }
                }
                Some(finished) = drivers.join_next(), if !drivers.is_empty() => {
                    if let Err(e) = finished
                        && e.is_panic()
                    {
                        error!("A task on event loop thread {} panicked: {e:?}", index);
                    }
                }
            }
        }

        debug!("Event loop thread {} stopping; cancelling {} sockets.", index, registrations.len());
        for token in registrations.values().chain(timers.iter()) {
            token.cancel();
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            while drivers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Event loop thread {} timed out waiting for sockets to close.", index);
        }
    });
}

async fn run_timer(
    interval: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => callback(),
        }
    }
}
