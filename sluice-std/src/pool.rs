//! Object pooling for per-exchange task state.
//!
//! A [`TaskPool`] keeps a bounded free list of reset task objects. Acquiring
//! returns a [`Pooled`] handle that gives the object back when dropped, so
//! every acquire is paired with exactly one release and a release without
//! an acquire cannot be written.

use parking_lot::Mutex;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Task state that can be recycled.
///
/// The `Default` value is the empty state a released task is left in.
pub trait PooledTask: Default + Send + 'static {
    /// Clears every reference to exchanges, callbacks and counters.
    fn reset(&mut self);
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolOptions {
    /// Maximum number of idle objects kept for reuse.
    pub capacity: usize,
}

impl PoolOptions {
    /// Options with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Counters kept by a pool.
#[derive(Debug, Default)]
pub struct PoolStatistics {
    created: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

impl PoolStatistics {
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A consistent-enough copy of the counters.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            created: self.created.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`PoolStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    /// Objects allocated because the free list was empty.
    pub created: usize,
    /// Objects handed out.
    pub acquired: usize,
    /// Objects returned to the free list.
    pub released: usize,
    /// Objects dropped instead of returned to the free list.
    pub discarded: usize,
}

impl PoolSnapshot {
    /// Objects currently handed out.
    pub fn in_flight(&self) -> usize {
        self.acquired
            .saturating_sub(self.released)
            .saturating_sub(self.discarded)
    }
}

/// A bounded free list of reusable task objects.
pub struct TaskPool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    statistics: PoolStatistics,
}

impl<T: PooledTask> TaskPool<T> {
    /// Creates an empty pool.
    pub fn new(options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(options.capacity)),
            capacity: options.capacity,
            statistics: PoolStatistics::default(),
        })
    }

    /// Takes an idle object, or creates one with `create`.
    pub fn acquire(self: &Arc<Self>, create: impl FnOnce() -> T) -> Pooled<T> {
        let recycled = self.free.lock().pop();
        let task = match recycled {
            Some(task) => task,
            None => {
                self.statistics.record_created();
                create()
            }
        };
        self.statistics.record_acquired();
        Pooled {
            task,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut task: T) {
        task.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(task);
            self.statistics.record_released();
        } else {
            drop(free);
            self.statistics.record_discarded();
        }
    }

    /// Number of idle objects.
    pub fn size(&self) -> usize {
        self.free.lock().len()
    }

    /// Maximum number of idle objects.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The pool's counters.
    pub fn statistics(&self) -> PoolSnapshot {
        self.statistics.snapshot()
    }
}

impl<T> fmt::Debug for TaskPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("capacity", &self.capacity)
            .field("statistics", &self.statistics)
            .finish_non_exhaustive()
    }
}

/// An object on loan from a [`TaskPool`]; dropping it returns the object.
pub struct Pooled<T: PooledTask> {
    task: T,
    pool: Arc<TaskPool<T>>,
}

impl<T: PooledTask> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.task
    }
}

impl<T: PooledTask> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.task
    }
}

impl<T: PooledTask> Drop for Pooled<T> {
    fn drop(&mut self) {
        let task = std::mem::take(&mut self.task);
        self.pool.release(task);
    }
}
