//! An [`ExecutorService`] backed by a tokio runtime.
//!
//! Tasks are continuation code that may block (for example a throttler
//! waiting on its semaphore), so they run on tokio's blocking pool. Delayed
//! tasks sleep on the runtime's timer first; the runtime must be built with
//! the time driver enabled.

use sluice_core::{ExecutorService, RejectedExecution, ScheduledHandle, Task};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::runtime::Handle;

/// Options for a [`TokioExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TokioExecutorOptions {
    /// Name reported in rejections.
    pub name: String,
    /// Maximum number of submitted tasks not yet finished.
    ///
    /// `None` accepts any number of tasks.
    pub max_pending: Option<usize>,
}

impl TokioExecutorOptions {
    /// Options with the given name and no bound.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_pending: None,
        }
    }

    /// Bounds the number of pending tasks.
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = Some(max_pending);
        self
    }
}

impl Default for TokioExecutorOptions {
    fn default() -> Self {
        Self::named("sluice")
    }
}

/// Runs engine tasks on a tokio runtime.
#[derive(Debug)]
pub struct TokioExecutor {
    handle: Handle,
    name: String,
    max_pending: Option<usize>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TokioExecutor {
    /// Creates an executor spawning onto `handle`.
    pub fn new(handle: Handle, options: TokioExecutorOptions) -> Self {
        Self {
            handle,
            name: options.name,
            max_pending: options.max_pending,
            pending: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates an executor on the runtime the caller is running in.
    pub fn current(options: TokioExecutorOptions) -> Result<Self, RejectedExecution> {
        let handle = Handle::try_current()
            .map_err(|e| RejectedExecution::new(options.name.clone(), e.to_string()))?;
        Ok(Self::new(handle, options))
    }

    /// Number of submitted tasks that have not finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn reject(&self, reason: &str) -> RejectedExecution {
        RejectedExecution::new(self.name.clone(), reason)
    }
}

impl ExecutorService for TokioExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: Task) -> Result<(), RejectedExecution> {
        if self.is_shutdown() {
            return Err(self.reject("executor is shut down"));
        }
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.pending));
        if let Some(max) = self.max_pending {
            if previous >= max {
                return Err(self.reject("too many pending tasks"));
            }
        }
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            task();
        });
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle, RejectedExecution> {
        if self.is_shutdown() {
            return Err(self.reject("executor is shut down"));
        }
        let handle = ScheduledHandle::new();
        let task = handle.guard(task);
        let shutdown = Arc::clone(&self.shutdown);
        let runtime = self.handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !shutdown.load(Ordering::Acquire) {
                runtime.spawn_blocking(task);
            }
        });
        Ok(handle)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn test_submit_runs_task() {
        let rt = runtime();
        let executor = TokioExecutor::new(rt.handle().clone(), TokioExecutorOptions::default());
        let (tx, rx) = mpsc::channel();
        executor
            .submit(Box::new(move || tx.send(42).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_bounded_executor_rejects() {
        let rt = runtime();
        let executor = TokioExecutor::new(
            rt.handle().clone(),
            TokioExecutorOptions::named("bounded").max_pending(1),
        );
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor
            .submit(Box::new(move || {
                let _ = release_rx.recv();
            }))
            .unwrap();
        let err = executor.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(err.executor, "bounded");
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_cancelled_schedule_does_not_run() {
        let rt = runtime();
        let executor = TokioExecutor::new(rt.handle().clone(), TokioExecutorOptions::default());
        let (tx, rx) = mpsc::channel();
        let handle = executor
            .schedule(Duration::from_millis(50), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let rt = runtime();
        let executor = TokioExecutor::new(rt.handle().clone(), TokioExecutorOptions::default());
        executor.shutdown();
        assert!(executor.submit(Box::new(|| {})).is_err());
    }
}
