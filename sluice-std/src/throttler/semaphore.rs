//! A counting semaphore whose permit count can change at runtime.
//!
//! The permit count lives in one atomic word. Acquire and release are
//! compare-and-swap operations on it; the mutex and condvar only park
//! waiting threads. Closing or retiring the semaphore seals the word by
//! subtracting a large offset, so a sealed semaphore can never hand out a
//! permit and the seal is atomic with every acquire.

use parking_lot::{Condvar, Mutex};
use std::{
    sync::atomic::{AtomicIsize, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Offset between the open, retired and closed ranges of the word.
const SEAL: isize = 1 << (isize::BITS - 4);

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A permit was taken.
    Acquired,
    /// No permit is free right now.
    Unavailable,
    /// The semaphore was retired; its owner hands out a fresh one.
    Retired,
    /// The semaphore was closed for good.
    Closed,
}

impl Acquire {
    /// Returns true if a permit was taken.
    pub fn is_acquired(self) -> bool {
        self == Acquire::Acquired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seal {
    Open,
    Retired,
    Closed,
}

fn decode(raw: isize) -> (Seal, isize) {
    if raw > -SEAL / 2 {
        (Seal::Open, raw)
    } else if raw > -SEAL - SEAL / 2 {
        (Seal::Retired, raw + SEAL)
    } else {
        (Seal::Closed, raw + 2 * SEAL)
    }
}

/// A counting semaphore with growable and shrinkable capacity.
///
/// Shrinking below the number of permits handed out drives the available
/// count negative; already acquired permits stay valid and new acquires
/// fail until enough of them are released.
#[derive(Debug)]
pub struct ResizableSemaphore {
    raw: AtomicIsize,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    freed: Condvar,
}

impl ResizableSemaphore {
    /// A semaphore with `permits` available permits.
    pub fn new(permits: usize) -> Self {
        Self {
            raw: AtomicIsize::new(to_isize(permits)),
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            freed: Condvar::new(),
        }
    }

    /// Takes a permit if one is available.
    pub fn try_acquire(&self) -> Acquire {
        let mut raw = self.raw.load(Ordering::SeqCst);
        loop {
            match decode(raw) {
                (Seal::Closed, _) => return Acquire::Closed,
                (Seal::Retired, _) => return Acquire::Retired,
                (Seal::Open, count) if count <= 0 => return Acquire::Unavailable,
                (Seal::Open, _) => {}
            }
            match self
                .raw
                .compare_exchange_weak(raw, raw - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Acquire::Acquired,
                Err(actual) => raw = actual,
            }
        }
    }

    /// Waits for a permit until one is free or the semaphore is sealed.
    pub fn acquire(&self) -> Acquire {
        self.acquire_until(None)
    }

    /// Waits up to `timeout` for a permit.
    pub fn acquire_timeout(&self, timeout: Duration) -> Acquire {
        self.acquire_until(Some(Instant::now() + timeout))
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> Acquire {
        loop {
            let outcome = self.try_acquire();
            if outcome != Acquire::Unavailable {
                return outcome;
            }
            let mut guard = self.lock.lock();
            self.waiters.fetch_add(1, Ordering::SeqCst);
            // Re-check after registering so a concurrent release wakes us.
            let outcome = self.try_acquire();
            if outcome != Acquire::Unavailable {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return outcome;
            }
            let timed_out = match deadline {
                Some(deadline) => self.freed.wait_until(&mut guard, deadline).timed_out(),
                None => {
                    self.freed.wait(&mut guard);
                    false
                }
            };
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            drop(guard);
            if timed_out {
                return self.try_acquire();
            }
        }
    }

    /// Returns a permit.
    pub fn release(&self) {
        self.raw.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.freed.notify_one();
        }
    }

    /// Adds `n` permits.
    pub fn grow(&self, n: usize) {
        self.raw.fetch_add(to_isize(n), Ordering::SeqCst);
        self.wake_all();
    }

    /// Removes `n` permits. Acquired permits are not revoked.
    pub fn shrink(&self, n: usize) {
        self.raw.fetch_sub(to_isize(n), Ordering::SeqCst);
    }

    /// Permits currently available; negative after shrinking below the
    /// number handed out.
    pub fn available_permits(&self) -> isize {
        decode(self.raw.load(Ordering::SeqCst)).1
    }

    /// Retires the semaphore if at least `permits` permits are free, that
    /// is when nothing is handed out. Returns true if it was retired.
    pub fn retire_if_free(&self, permits: isize) -> bool {
        let mut raw = self.raw.load(Ordering::SeqCst);
        loop {
            match decode(raw) {
                (Seal::Open, count) if count >= permits => {}
                _ => return false,
            }
            match self
                .raw
                .compare_exchange_weak(raw, raw - SEAL, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => raw = actual,
            }
        }
        self.wake_all();
        true
    }

    /// Fails every current and future acquire.
    pub fn close(&self) {
        let mut raw = self.raw.load(Ordering::SeqCst);
        loop {
            let sealed = match decode(raw).0 {
                Seal::Closed => return,
                Seal::Retired => raw - SEAL,
                Seal::Open => raw - 2 * SEAL,
            };
            match self
                .raw
                .compare_exchange_weak(raw, sealed, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => raw = actual,
            }
        }
        self.wake_all();
    }

    /// Returns true once [`close`](ResizableSemaphore::close) was called.
    pub fn is_closed(&self) -> bool {
        decode(self.raw.load(Ordering::SeqCst)).0 == Seal::Closed
    }

    /// Returns true once the semaphore was retired.
    pub fn is_retired(&self) -> bool {
        decode(self.raw.load(Ordering::SeqCst)).0 == Seal::Retired
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.freed.notify_all();
    }
}

fn to_isize(n: usize) -> isize {
    isize::try_from(n).unwrap_or(isize::MAX).min(SEAL / 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_try_acquire_until_exhausted() {
        let semaphore = ResizableSemaphore::new(2);
        assert!(semaphore.try_acquire().is_acquired());
        assert!(semaphore.try_acquire().is_acquired());
        assert_eq!(semaphore.try_acquire(), Acquire::Unavailable);
        semaphore.release();
        assert!(semaphore.try_acquire().is_acquired());
    }

    #[test]
    fn test_shrink_keeps_acquired_permits() {
        let semaphore = ResizableSemaphore::new(5);
        for _ in 0..4 {
            assert!(semaphore.try_acquire().is_acquired());
        }
        semaphore.shrink(3);
        assert_eq!(semaphore.available_permits(), -2);
        assert!(!semaphore.try_acquire().is_acquired());
        semaphore.release();
        semaphore.release();
        assert!(!semaphore.try_acquire().is_acquired());
        semaphore.release();
        assert!(semaphore.try_acquire().is_acquired());
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let semaphore = Arc::new(ResizableSemaphore::new(1));
        assert!(semaphore.try_acquire().is_acquired());
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        semaphore.release();
        assert_eq!(waiter.join().unwrap(), Acquire::Acquired);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let semaphore = Arc::new(ResizableSemaphore::new(0));
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        semaphore.close();
        assert_eq!(waiter.join().unwrap(), Acquire::Closed);
        assert_eq!(
            semaphore.acquire_timeout(Duration::from_millis(1)),
            Acquire::Closed
        );
        assert!(semaphore.is_closed());
    }

    #[test]
    fn test_retire_only_when_nothing_is_held() {
        let semaphore = ResizableSemaphore::new(2);
        assert!(semaphore.try_acquire().is_acquired());
        assert!(!semaphore.retire_if_free(2));
        semaphore.release();
        assert!(semaphore.retire_if_free(2));
        assert!(semaphore.is_retired());
        assert_eq!(semaphore.available_permits(), 2);
        assert_eq!(semaphore.try_acquire(), Acquire::Retired);

        semaphore.close();
        assert_eq!(semaphore.try_acquire(), Acquire::Closed);
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[test]
    fn test_timed_acquire_gives_up() {
        let semaphore = ResizableSemaphore::new(0);
        assert_eq!(
            semaphore.acquire_timeout(Duration::from_millis(10)),
            Acquire::Unavailable
        );
    }

    #[test]
    fn test_contended_permits_are_never_oversubscribed() {
        let semaphore = Arc::new(ResizableSemaphore::new(3));
        let inside = Arc::new(AtomicIsize::new(0));
        let peak = Arc::new(AtomicIsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let (semaphore, inside, peak) = (semaphore.clone(), inside.clone(), peak.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        assert!(semaphore.acquire().is_acquired());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        semaphore.release();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.available_permits(), 3);
    }
}
