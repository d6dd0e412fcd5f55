//! The executor service seam.
//!
//! Parallel multicast, throttler async delay, multicast timeouts and
//! throttler state cleanup run on an externally supplied thread pool. The
//! engine only needs submission, delayed scheduling and shutdown.

use crate::{error::RejectedExecution, reactive::Task};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// A thread pool the engine can hand work to.
pub trait ExecutorService: Send + Sync + 'static {
    /// Name used in rejection errors and logs.
    fn name(&self) -> &str;

    /// Runs `task` as soon as possible.
    fn submit(&self, task: Task) -> Result<(), RejectedExecution>;

    /// Runs `task` once `delay` has elapsed, unless the handle is cancelled.
    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle, RejectedExecution>;

    /// Stops accepting work.
    fn shutdown(&self);

    /// Returns true once [`shutdown`](ExecutorService::shutdown) was called.
    fn is_shutdown(&self) -> bool;
}

/// A shared executor service.
pub type SharedExecutor = Arc<dyn ExecutorService>;

/// Handle to a delayed task.
#[derive(Debug, Clone, Default)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    /// A fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevents the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wraps `task` so it becomes a no-op once this handle is cancelled.
    pub fn guard(&self, task: Task) -> Task {
        let cancelled = Arc::clone(&self.cancelled);
        Box::new(move || {
            if !cancelled.load(Ordering::Acquire) {
                task()
            }
        })
    }
}
