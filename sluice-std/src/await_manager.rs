//! Blocking bridge from continuation style to call/return.
//!
//! [`process_sync`] drives an [`AsyncProcessor`] until its callback fires
//! and hands the exchange back. While waiting it keeps the current thread's
//! reactive queue moving, so continuations scheduled on this thread by the
//! processor itself still run and nothing deadlocks.

use futures::channel::oneshot;
use sluice_core::{AsyncCallback, AsyncProcessor, Exchange, reactive};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

static BLOCKED: AtomicUsize = AtomicUsize::new(0);
static AWAITED: AtomicUsize = AtomicUsize::new(0);

/// The callback was dropped without being invoked.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the processor dropped its callback without completing the exchange")]
pub struct CallbackDropped;

/// Runs `start` with a fresh callback and waits until that callback fires.
///
/// `start` receives the callback and returns the processor's `done_sync`
/// result. Returns the exchange passed to the callback.
pub fn await_callback<F>(start: F) -> Result<Exchange, CallbackDropped>
where
    F: FnOnce(AsyncCallback) -> bool,
{
    let (tx, mut rx) = oneshot::channel();
    let callback = AsyncCallback::new(move |exchange, _| {
        // The receiver is gone only when the waiter gave up.
        let _ = tx.send(exchange);
    });
    AWAITED.fetch_add(1, Ordering::Relaxed);
    start(callback);

    loop {
        match rx.try_recv() {
            Ok(Some(exchange)) => return Ok(exchange),
            Ok(None) => {}
            Err(oneshot::Canceled) => return Err(CallbackDropped),
        }
        if reactive::execute_from_queue() {
            continue;
        }
        BLOCKED.fetch_add(1, Ordering::Relaxed);
        let result = futures::executor::block_on(&mut rx);
        BLOCKED.fetch_sub(1, Ordering::Relaxed);
        return result.map_err(|_| CallbackDropped);
    }
}

/// Processes `exchange` and blocks until it is done.
pub fn process_sync(
    processor: &dyn AsyncProcessor,
    exchange: Exchange,
) -> Result<Exchange, CallbackDropped> {
    await_callback(|callback| processor.process(exchange, callback))
}

/// Number of threads currently blocked waiting for a callback.
pub fn blocked_threads() -> usize {
    BLOCKED.load(Ordering::Relaxed)
}

/// Total number of exchanges processed through [`await_callback`].
pub fn awaited_exchanges() -> usize {
    AWAITED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{Value, processor};
    use std::{thread, time::Duration};

    #[test]
    fn test_sync_processor() {
        let p = processor(|ex| {
            ex.set_body("done");
            Ok(())
        });
        let ex = process_sync(p.as_ref(), Exchange::new("x")).unwrap();
        assert_eq!(ex.body(), &Value::from("done"));
    }

    #[test]
    fn test_completion_from_another_thread() {
        let ex = await_callback(|callback| {
            let exchange = Exchange::new("later");
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                callback.done(exchange, false);
            });
            false
        })
        .unwrap();
        assert_eq!(ex.body(), &Value::from("later"));
    }

    #[test]
    fn test_queued_continuation_is_driven() {
        let ex = await_callback(|callback| {
            reactive::schedule_queue(move || callback.done(Exchange::new("queued"), false));
            false
        })
        .unwrap();
        assert_eq!(ex.body(), &Value::from("queued"));
    }

    #[test]
    fn test_dropped_callback() {
        let err = await_callback(|callback| {
            drop(callback);
            false
        })
        .unwrap_err();
        assert_eq!(err, CallbackDropped);
    }
}
