// src/core/runtime/worker_pool.rs

//! The bounded pool that runs every user-level callback off the event-loop threads.
//!
//! Work is submitted through a [`WorkerLane`]. Each lane is a FIFO drained by one
//! async task, so the jobs of one lane never run concurrently or out of order.
//! Jobs themselves execute on tokio's blocking pool, and a semaphore caps how many
//! of them may run at the same time across all lanes.

use crate::core::BrokerError;
use crate::core::metrics;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{Span, debug, error, warn};

/// A unit of user-level work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of worker threads shared by every lane.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    handle: Handle,
    lanes: TaskTracker,
}

impl WorkerPool {
    /// Creates a pool that runs at most `size` jobs at once. Lane tasks are
    /// spawned on the runtime behind `handle`.
    pub fn new(size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                handle,
                lanes: TaskTracker::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// The number of jobs running right now.
    pub fn busy(&self) -> usize {
        self.inner.size - self.inner.permits.available_permits()
    }

    /// Opens a new serialized lane. Every job posted to it runs inside `span`.
    /// The lane lives until the last clone of the returned handle is dropped and
    /// its queue is drained.
    pub fn lane(&self, name: impl Into<String>, span: Span) -> WorkerLane {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = self.inner.permits.clone();
        self.inner.lanes.spawn_on(
            drain_lane(name.clone(), rx, permits, span),
            &self.inner.handle,
        );
        WorkerLane { name, tx }
    }

    /// Waits up to `timeout` for every lane to drain. Returns `false` if some
    /// lanes were still busy when the timeout expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.lanes.close();
        match tokio::time::timeout(timeout, self.inner.lanes.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Timed out waiting for {} worker lanes to drain.",
                    self.inner.lanes.len()
                );
                false
            }
        }
    }
}

/// A handle for submitting work that must run in order.
#[derive(Clone, Debug)]
pub struct WorkerLane {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkerLane {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `job` behind every job previously posted to this lane.
    pub fn post<F>(&self, job: F) -> Result<(), BrokerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .map_err(|_| BrokerError::PoolShutdown)
    }
}

async fn drain_lane(
    name: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    permits: Arc<Semaphore>,
    span: Span,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let started = Instant::now();
        let job_span = span.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _entered = job_span.enter();
            job();
        })
        .await;
        drop(permit);
        metrics::WORKER_JOB_SECONDS.observe(started.elapsed().as_secs_f64());

        if let Err(e) = result
            && e.is_panic()
        {
            metrics::HANDLER_ERRORS_TOTAL
                .with_label_values(&["worker"])
                .inc();
            error!(
                "Job on worker lane '{}' panicked: {}",
                name,
                panic_message(&*e.into_panic())
            );
        }
    }
    debug!("Worker lane '{}' drained and closed.", name);
}

/// Runs `f`, turning a panic into [`BrokerError::Handler`] so the caller can log
/// it at its own dispatch boundary.
pub fn isolate<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, BrokerError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(BrokerError::Handler(panic_message(&*payload))),
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
