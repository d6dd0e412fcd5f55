//! Catch clauses.
//!
//! A [`Catch`] inspects the failure of the exchange it receives. When one
//! of its [`ErrorMatcher`]s recognises an error in the cause chain, the
//! failure is moved to the `exception_caught` property, the exchange is
//! marked as handled and routed to the clause body. Exchanges without a
//! matching failure pass through untouched.
//!
//! The cause chain is walked from the innermost cause outwards; for each
//! cause the matchers are tried in declaration order. The first match
//! wins, even when a later matcher would be more specific.

use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Failure, Service, SharedPredicate,
    SharedProcessor,
};
use std::{
    any::type_name,
    error::Error,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

type MatchFn = dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync;

/// Recognises one kind of error.
#[derive(Clone)]
pub struct ErrorMatcher {
    name: String,
    matches: Arc<MatchFn>,
}

impl ErrorMatcher {
    /// Matches errors of the concrete type `E`.
    pub fn of<E: Error + 'static>() -> Self {
        Self {
            name: type_name::<E>().to_owned(),
            matches: Arc::new(|error| error.is::<E>()),
        }
    }

    /// Matches errors accepted by `f`.
    pub fn when<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matches: Arc::new(f),
        }
    }

    /// Matches every error.
    pub fn any() -> Self {
        Self::when("any", |_| true)
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if `error` is recognised.
    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        (self.matches)(error)
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

/// A catch clause.
pub struct Catch {
    matchers: Vec<ErrorMatcher>,
    on_when: Option<SharedPredicate>,
    handled: Option<SharedPredicate>,
    processor: SharedProcessor,
    caught: AtomicUsize,
}

impl Catch {
    /// Routes failures recognised by any of `matchers` to `processor`.
    pub fn new(matchers: Vec<ErrorMatcher>, processor: SharedProcessor) -> Self {
        Self {
            matchers,
            on_when: None,
            handled: None,
            processor,
            caught: AtomicUsize::new(0),
        }
    }

    /// Only catches exchanges that also match `predicate`.
    pub fn on_when(mut self, predicate: SharedPredicate) -> Self {
        self.on_when = Some(predicate);
        self
    }

    /// Decides whether the caught failure counts as handled. When it does
    /// not, the failure is put back once the body is done.
    pub fn handled(mut self, predicate: SharedPredicate) -> Self {
        self.handled = Some(predicate);
        self
    }

    /// The matchers, in declaration order.
    pub fn matchers(&self) -> &[ErrorMatcher] {
        &self.matchers
    }

    /// Number of failures caught.
    pub fn caught_count(&self) -> usize {
        self.caught.load(Ordering::Relaxed)
    }

    /// Returns the name of the matcher recognising the exchange's failure.
    pub fn catches(&self, exchange: &Exchange) -> Option<&str> {
        let failure = exchange.exception()?;
        let causes: Vec<_> = failure.chain().collect();
        for cause in causes.into_iter().rev() {
            for matcher in &self.matchers {
                if matcher.matches(cause) && self.guard_matches(exchange) {
                    return Some(matcher.name());
                }
            }
        }
        None
    }

    fn guard_matches(&self, exchange: &Exchange) -> bool {
        let Some(on_when) = &self.on_when else {
            return true;
        };
        on_when.matches(exchange).unwrap_or_else(|error| {
            tracing::warn!(%error, "catch guard failed, clause skipped");
            false
        })
    }

    fn is_handled(&self, exchange: &Exchange) -> bool {
        let Some(handled) = &self.handled else {
            return true;
        };
        handled.matches(exchange).unwrap_or_else(|error| {
            tracing::warn!(%error, "catch handled predicate failed, treating as unhandled");
            false
        })
    }
}

impl Service for Catch {
    fn do_build(&self) -> Result<(), BoxError> {
        self.processor.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.processor.init()
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.processor.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.processor.stop()
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.processor.shutdown()
    }
}

impl AsyncProcessor for Catch {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        // A previous clause of the same try block already took the failure.
        if exchange.properties().failure_handled {
            callback.done(exchange, true);
            return true;
        }
        let Some(matcher) = self.catches(&exchange) else {
            callback.done(exchange, true);
            return true;
        };
        tracing::debug!(
            exchange_id = exchange.exchange_id(),
            matcher,
            "exception caught"
        );
        self.caught.fetch_add(1, Ordering::Relaxed);

        let failure = exchange.take_exception();
        let properties = exchange.properties_mut();
        properties.failure_endpoint = properties.to_endpoint.clone();
        properties.exception_caught = failure;
        exchange.set_redelivery_exhausted(false);

        let handled = self.is_handled(&exchange);
        exchange.properties_mut().failure_handled = true;
        let rollback_only = exchange.is_rollback_only();
        let rollback_only_last = exchange.is_rollback_only_last();
        // The catch body must run to its end even if routing was stopped.
        let route_stop = exchange.is_route_stop();
        exchange.set_route_stop(false);

        self.processor.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                if !handled && !exchange.is_failed() {
                    let caught: Option<Failure> = exchange.properties().exception_caught.clone();
                    exchange.replace_exception(caught);
                }
                exchange.set_redelivery_exhausted(false);
                if rollback_only || rollback_only_last {
                    exchange.set_rollback_only(rollback_only);
                    exchange.set_rollback_only_last(rollback_only_last);
                }
                if route_stop {
                    exchange.set_route_stop(true);
                }
                callback.done(exchange, done_sync);
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{await_manager::process_sync, pipeline::Pipeline, testing::RecordingProcessor};
    use sluice_core::{RoutingError, predicate, processor};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Debug, Error)]
    #[error("write failed")]
    struct WriteFailed(#[source] DiskFull);

    fn failed(error: impl Error + Send + Sync + 'static) -> Exchange {
        let mut ex = Exchange::new("x");
        ex.set_exception(error);
        ex
    }

    #[test]
    fn test_matching_failure_is_handled() {
        let recorder = RecordingProcessor::new();
        let catch = Catch::new(vec![ErrorMatcher::of::<DiskFull>()], recorder.shared());
        let ex = process_sync(&catch, failed(DiskFull)).unwrap();
        assert!(!ex.is_failed());
        assert!(ex.properties().failure_handled);
        assert!(ex.properties().exception_caught.as_ref().unwrap().is::<DiskFull>());
        assert_eq!(recorder.count(), 1);
        assert_eq!(catch.caught_count(), 1);
    }

    #[test]
    fn test_non_matching_passes_through() {
        let recorder = RecordingProcessor::new();
        let catch = Catch::new(vec![ErrorMatcher::of::<RoutingError>()], recorder.shared());
        let ex = process_sync(&catch, failed(DiskFull)).unwrap();
        assert!(ex.is_failed());
        assert_eq!(recorder.count(), 0);

        let ex = process_sync(&catch, Exchange::new("ok")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_cause_chain_walked_innermost_first() {
        let seen = Catch::new(
            vec![ErrorMatcher::of::<WriteFailed>(), ErrorMatcher::of::<DiskFull>()],
            processor(|_| Ok(())),
        );
        let ex = failed(WriteFailed(DiskFull));
        let name = seen.catches(&ex).unwrap();
        assert!(name.ends_with("DiskFull"));
    }

    #[test]
    fn test_on_when_guard() {
        let catch = Catch::new(vec![ErrorMatcher::any()], processor(|_| Ok(())))
            .on_when(predicate(|ex| ex.input().header("retry").is_some()));
        let ex = process_sync(&catch, failed(DiskFull)).unwrap();
        assert!(ex.is_failed());
        let ex = process_sync(&catch, failed(DiskFull).with_header("retry", true)).unwrap();
        assert!(!ex.is_failed());
    }

    #[test]
    fn test_unhandled_restores_failure() {
        let catch = Catch::new(vec![ErrorMatcher::any()], processor(|_| Ok(())))
            .handled(predicate(|_| false));
        let ex = process_sync(&catch, failed(DiskFull)).unwrap();
        assert!(ex.exception().unwrap().is::<DiskFull>());
    }

    #[test]
    fn test_rollback_flags_are_restored() {
        let catch = Catch::new(
            vec![ErrorMatcher::any()],
            processor(|ex| {
                ex.set_rollback_only(false);
                Ok(())
            }),
        );
        let mut ex = failed(DiskFull);
        ex.set_rollback_only(true);
        let ex = process_sync(&catch, ex).unwrap();
        assert!(ex.is_rollback_only());
    }

    #[test]
    fn test_stop_flag_does_not_cut_catch_body_short() {
        let recorder = RecordingProcessor::new();
        let body = Pipeline::new(vec![processor(|_| Ok(())), recorder.shared()]);
        let catch = Catch::new(vec![ErrorMatcher::of::<DiskFull>()], Arc::new(body));
        let mut ex = failed(DiskFull);
        ex.set_route_stop(true);
        let ex = process_sync(&catch, ex).unwrap();
        assert_eq!(recorder.count(), 1);
        assert!(ex.is_route_stop());
        assert!(!ex.is_failed());
    }
}
