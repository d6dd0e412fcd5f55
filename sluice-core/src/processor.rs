//! Processors and the continuation contract.
//!
//! An [`AsyncProcessor`] takes ownership of an exchange and an
//! [`AsyncCallback`]. It must hand the exchange back through the callback
//! exactly once, and its return value tells the caller on which stack that
//! happened:
//!
//! - `true`: the callback has already been invoked on the calling thread
//!   with `done_sync = true`.
//! - `false`: processing continues elsewhere; the callback will be invoked
//!   later, possibly from another thread, with `done_sync = false`.
//!
//! Composition primitives use this to decide whether they may continue on
//! the current stack or must reschedule through the reactive executor.
//!
//! The simpler [`Processor`] trait covers synchronous work on a borrowed
//! exchange and is adapted into an async processor by [`SyncAdapter`].

use crate::{
    error::{BoxError, Failure},
    exchange::Exchange,
    service::Service,
};
use std::{fmt, sync::Arc};

/// The continuation invoked when an asynchronous processor is done.
pub struct AsyncCallback {
    inner: Box<dyn FnOnce(Exchange, bool) + Send + 'static>,
}

impl AsyncCallback {
    /// Wraps a closure receiving the exchange and the `done_sync` flag.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        Self { inner: Box::new(f) }
    }

    /// A callback that drops the exchange.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Signals completion, handing the exchange back.
    pub fn done(self, exchange: Exchange, done_sync: bool) {
        (self.inner)(exchange, done_sync)
    }
}

impl fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncCallback")
    }
}

/// A processor in continuation-passing style.
///
/// See the [module documentation](self) for the return value contract.
#[diagnostic::on_unimplemented(
    message = "`{Self}` does not implement `AsyncProcessor`",
    label = "missing `AsyncProcessor` implementation",
    note = "Synchronous closures `Fn(&mut Exchange) -> Result<(), BoxError>` can be adapted with `processor(...)`."
)]
pub trait AsyncProcessor: Service + Send + Sync + 'static {
    /// Processes the exchange, returning whether the callback already ran.
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool;

    /// Identifier used in logs and traces.
    fn id(&self) -> Option<&str> {
        None
    }
}

/// A shared, type-erased async processor.
pub type SharedProcessor = Arc<dyn AsyncProcessor>;

/// A synchronous processor working on a borrowed exchange.
///
/// Returning an error attaches it to the exchange as its failure.
pub trait Processor: Send + Sync + 'static {
    /// Processes the exchange in place.
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError>;
}

impl<F> Processor for F
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        self(exchange)
    }
}

/// Adapts a [`Processor`] into an [`AsyncProcessor`] that always
/// completes synchronously.
pub struct SyncAdapter<P> {
    inner: P,
    id: Option<String>,
}

impl<P: Processor> SyncAdapter<P> {
    /// Wraps a synchronous processor.
    pub fn new(inner: P) -> Self {
        Self { inner, id: None }
    }

    /// Sets the identifier reported by [`AsyncProcessor::id`].
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The wrapped processor.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: Processor> Service for SyncAdapter<P> {}

impl<P: Processor> AsyncProcessor for SyncAdapter<P> {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if let Err(error) = self.inner.process(&mut exchange) {
            exchange.set_exception(Failure::from_boxed(error));
        }
        callback.done(exchange, true);
        true
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Builds a shared processor from a synchronous closure.
pub fn processor<F>(f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(SyncAdapter::new(f))
}

/// Type-erases an async processor.
pub fn shared<P: AsyncProcessor>(processor: P) -> SharedProcessor {
    Arc::new(processor)
}

/// Address of the processor's allocation, used as an identity key.
pub fn processor_key(processor: &SharedProcessor) -> usize {
    Arc::as_ptr(processor) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use parking_lot::Mutex;

    #[test]
    fn test_sync_adapter_completes_on_calling_thread() {
        let p = processor(|ex| {
            ex.set_body("done");
            Ok(())
        });
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let sync = p.process(
            Exchange::new("x"),
            AsyncCallback::new(move |ex, done_sync| {
                *sink.lock() = Some((ex.body().clone(), done_sync));
            }),
        );
        assert!(sync);
        assert_eq!(*seen.lock(), Some((Value::from("done"), true)));
    }

    #[test]
    fn test_sync_adapter_attaches_error() {
        let p = processor(|_| Err("broken".into()));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        p.process(
            Exchange::new("x"),
            AsyncCallback::new(move |ex, _| {
                *sink.lock() = ex.exception().map(|f| f.to_string());
            }),
        );
        assert_eq!(seen.lock().as_deref(), Some("broken"));
    }
}
