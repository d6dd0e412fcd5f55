//! Bounding concurrent in-flight exchanges per correlation key.
//!
//! The throttler takes a permit from the key's [`ResizableSemaphore`] and
//! lets the exchange continue; the permit is returned by a completion hook
//! when the exchange's unit of work is done, or when the hook is dropped
//! with an exchange that never had one. The limit is re-evaluated for
//! every exchange and the semaphore is resized when it changed.
//!
//! When no permit is free the exchange is, in order of preference,
//! rejected, queued on the executor service, or blocks the caller.

mod semaphore;

pub use semaphore::{Acquire, ResizableSemaphore};

use dashmap::DashMap;
use parking_lot::Mutex;
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Failure, RoutingError, ScheduledHandle,
    Service, ServiceState, SharedExecutor, SharedExpression, Synchronization, ThrottleEnqueue,
    Value,
};
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

const DEFAULT_KEY: &str = "";

/// Behaviour switches of a throttler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThrottlerOptions {
    /// Fail exchanges that find the limit reached.
    pub reject_execution: bool,
    /// Queue exchanges that find the limit reached on the executor.
    pub async_delayed: bool,
    /// Block the caller when the executor refuses a queued exchange.
    pub caller_runs_when_rejected: bool,
    /// Idle period after which the state of a key is dropped.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub cleanup_period: Duration,
    /// Shut the executor down together with the throttler.
    pub shutdown_executor: bool,
}

impl Default for ThrottlerOptions {
    fn default() -> Self {
        Self {
            reject_execution: false,
            async_delayed: false,
            caller_runs_when_rejected: true,
            cleanup_period: Duration::from_secs(10),
            shutdown_executor: false,
        }
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// The permits of one correlation key.
#[derive(Debug)]
pub struct ThrottlingState {
    key: String,
    max: Mutex<usize>,
    semaphore: ResizableSemaphore,
    cleanup: Mutex<Option<ScheduledHandle>>,
}

impl ThrottlingState {
    fn new(key: String) -> Self {
        Self {
            key,
            max: Mutex::new(0),
            semaphore: ResizableSemaphore::new(0),
            cleanup: Mutex::new(None),
        }
    }

    /// The correlation key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current limit.
    pub fn max(&self) -> usize {
        *self.max.lock()
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> isize {
        self.semaphore.available_permits()
    }

    /// Resizes the semaphore to `max` permits.
    fn set_max(&self, max: usize) {
        let mut current = self.max.lock();
        if *current == max {
            return;
        }
        if max > *current {
            self.semaphore.grow(max - *current);
        } else {
            self.semaphore.shrink(*current - max);
        }
        tracing::debug!(key = %self.key, from = *current, to = max, "throttle rate changed");
        *current = max;
    }

    /// Retires the state when no permit is handed out. A retired state
    /// refuses every acquire, so it can leave the map without anyone still
    /// taking permits from it.
    fn retire_if_idle(&self) -> bool {
        let max = self.max.lock();
        self.semaphore
            .retire_if_free(isize::try_from(*max).unwrap_or(isize::MAX))
    }
}

/// Returns the permit when the exchange's unit of work is done.
struct PermitRelease {
    state: Arc<ThrottlingState>,
    throttler: Weak<Inner>,
    released: AtomicBool,
}

impl PermitRelease {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.semaphore.release();
        if let Some(throttler) = self.throttler.upgrade() {
            throttler.schedule_cleanup(&self.state);
        }
    }
}

// A hook dropped without firing, for example together with an exchange
// that never got a unit of work, still returns its permit.
impl Drop for PermitRelease {
    fn drop(&mut self) {
        self.release();
    }
}

impl Synchronization for PermitRelease {
    fn on_complete(&self, _exchange: &mut Exchange) {
        self.release();
    }

    fn on_failure(&self, _exchange: &mut Exchange) {
        self.release();
    }
}

struct Inner {
    max_requests: SharedExpression,
    correlation: Option<SharedExpression>,
    options: ThrottlerOptions,
    executor: Option<SharedExecutor>,
    states: DashMap<String, Arc<ThrottlingState>>,
}

/// Limits the number of exchanges in flight at once.
pub struct Throttler {
    inner: Arc<Inner>,
    id: Option<String>,
    state: ServiceState,
}

/// Builder for [`Throttler`].
pub struct ThrottlerBuilder {
    max_requests: SharedExpression,
    correlation: Option<SharedExpression>,
    options: ThrottlerOptions,
    executor: Option<SharedExecutor>,
    id: Option<String>,
}

impl ThrottlerBuilder {
    /// Groups exchanges by the value of `expression`.
    pub fn correlation(mut self, expression: SharedExpression) -> Self {
        self.correlation = Some(expression);
        self
    }

    /// Replaces all options.
    pub fn options(mut self, options: ThrottlerOptions) -> Self {
        self.options = options;
        self
    }

    /// Fails exchanges that find the limit reached.
    pub fn reject_execution(mut self, enabled: bool) -> Self {
        self.options.reject_execution = enabled;
        self
    }

    /// Queues waiting exchanges on the executor instead of blocking.
    pub fn async_delayed(mut self, enabled: bool) -> Self {
        self.options.async_delayed = enabled;
        self
    }

    /// Blocks the caller when the executor refuses a queued exchange.
    pub fn caller_runs_when_rejected(mut self, enabled: bool) -> Self {
        self.options.caller_runs_when_rejected = enabled;
        self
    }

    /// Sets the idle period before a key's state is dropped.
    pub fn cleanup_period(mut self, period: Duration) -> Self {
        self.options.cleanup_period = period;
        self
    }

    /// Sets the executor for queued exchanges and state cleanup.
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the identifier used in logs.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builds the throttler.
    pub fn build(self) -> Throttler {
        Throttler {
            inner: Arc::new(Inner {
                max_requests: self.max_requests,
                correlation: self.correlation,
                options: self.options,
                executor: self.executor,
                states: DashMap::new(),
            }),
            id: self.id,
            state: ServiceState::new(),
        }
    }
}

impl Throttler {
    /// Starts building a throttler whose limit is the value of
    /// `max_requests`.
    pub fn builder(max_requests: SharedExpression) -> ThrottlerBuilder {
        ThrottlerBuilder {
            max_requests,
            correlation: None,
            options: ThrottlerOptions::default(),
            executor: None,
            id: None,
        }
    }

    /// The configured options.
    pub fn options(&self) -> &ThrottlerOptions {
        &self.inner.options
    }

    /// The limit currently in force for `key`, if the key is active.
    pub fn current_max_concurrent_requests(&self, key: &str) -> Option<usize> {
        self.inner.states.get(key).map(|state| state.max())
    }

    /// The limit in force for ungrouped exchanges.
    pub fn current_max(&self) -> Option<usize> {
        self.current_max_concurrent_requests(DEFAULT_KEY)
    }

    /// The keys that currently have state.
    pub fn active_keys(&self) -> Vec<String> {
        self.inner
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The state of `key`, if active.
    pub fn throttling_state(&self, key: &str) -> Option<Arc<ThrottlingState>> {
        self.inner.states.get(key).map(|state| Arc::clone(state.value()))
    }
}

fn to_limit(value: &Value) -> Option<usize> {
    match value {
        Value::Int(n) => usize::try_from(*n).ok(),
        Value::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn fail(mut exchange: Exchange, callback: AsyncCallback, failure: Failure) -> bool {
    exchange.set_exception(failure);
    callback.done(exchange, true);
    true
}

impl Inner {
    fn key(&self, exchange: &Exchange) -> Result<String, RoutingError> {
        match &self.correlation {
            None => Ok(DEFAULT_KEY.to_owned()),
            Some(expression) => expression
                .evaluate(exchange)
                .map(|value| value.to_text())
                .map_err(|e| RoutingError::Expression(e.to_string())),
        }
    }

    fn limit(&self, exchange: &Exchange) -> Result<usize, RoutingError> {
        let value = self
            .max_requests
            .evaluate(exchange)
            .map_err(|e| RoutingError::Expression(e.to_string()))?;
        to_limit(&value).ok_or_else(|| {
            RoutingError::Expression(format!(
                "max concurrent requests must be a non-negative integer, got {value:?}"
            ))
        })
    }

    fn state_for(&self, key: String) -> Arc<ThrottlingState> {
        let entry = self
            .states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ThrottlingState::new(key)));
        Arc::clone(entry.value())
    }

    /// Throttles `exchange`. `mode` is how the caller got here: directly,
    /// from the executor queue, or on the caller after the queue refused.
    fn throttle(
        self: &Arc<Self>,
        exchange: Exchange,
        callback: AsyncCallback,
        mode: ThrottleEnqueue,
    ) -> bool {
        let resolved = self
            .key(&exchange)
            .and_then(|key| self.limit(&exchange).map(|limit| (key, limit)));
        let (key, limit) = match resolved {
            Ok(resolved) => resolved,
            Err(error) => return self.finish(exchange, callback, Err(Failure::new(error)), mode),
        };
        let mut state = self.state_for(key);
        loop {
            state.set_max(limit);
            match state.semaphore.try_acquire() {
                Acquire::Acquired => return self.finish(exchange, callback, Ok(state), mode),
                Acquire::Retired => state = self.state_for(state.key.clone()),
                Acquire::Unavailable | Acquire::Closed => break,
            }
        }
        if mode != ThrottleEnqueue::Sync {
            return self.block(exchange, callback, state, mode);
        }
        if self.options.reject_execution {
            let error = RoutingError::ThrottlerRejected { max: state.max() };
            tracing::debug!(key = %state.key, %error, "throttler rejected exchange");
            return fail(exchange, callback, Failure::new(error));
        }
        match &self.executor {
            Some(executor) if self.options.async_delayed && !exchange.is_transacted() => {
                let mut exchange = exchange;
                let properties = exchange.properties_mut();
                properties.throttle_state = Some(ThrottleEnqueue::Async);
                properties.throttle_queued_at = Some(Instant::now());
                tracing::trace!(
                    key = %state.key,
                    exchange_id = exchange.exchange_id(),
                    "throttler queued exchange"
                );
                // A refused task never runs, so the exchange is taken back
                // out of the shared slot.
                let slot = Arc::new(Mutex::new(Some((exchange, callback))));
                let queued = Arc::clone(&slot);
                let throttler = Arc::clone(self);
                let submitted = executor.submit(Box::new(move || {
                    if let Some((exchange, callback)) = queued.lock().take() {
                        throttler.throttle(exchange, callback, ThrottleEnqueue::Async);
                    }
                }));
                match submitted {
                    Ok(()) => false,
                    Err(rejected) => {
                        let Some((mut exchange, callback)) = slot.lock().take() else {
                            return false;
                        };
                        if self.options.caller_runs_when_rejected {
                            exchange.properties_mut().throttle_state =
                                Some(ThrottleEnqueue::AsyncRejected);
                            self.block(exchange, callback, state, ThrottleEnqueue::AsyncRejected)
                        } else {
                            fail(exchange, callback, Failure::new(RoutingError::Rejected(rejected)))
                        }
                    }
                }
            }
            _ => self.block(exchange, callback, state, mode),
        }
    }

    fn block(
        self: &Arc<Self>,
        exchange: Exchange,
        callback: AsyncCallback,
        mut state: Arc<ThrottlingState>,
        mode: ThrottleEnqueue,
    ) -> bool {
        loop {
            match state.semaphore.acquire() {
                Acquire::Acquired => return self.finish(exchange, callback, Ok(state), mode),
                Acquire::Retired => {
                    let limit = state.max();
                    state = self.state_for(state.key.clone());
                    state.set_max(limit);
                }
                Acquire::Unavailable | Acquire::Closed => {
                    let error = RoutingError::NotStarted("throttler");
                    return self.finish(exchange, callback, Err(Failure::new(error)), mode);
                }
            }
        }
    }

    fn finish(
        self: &Arc<Self>,
        mut exchange: Exchange,
        callback: AsyncCallback,
        admitted: Result<Arc<ThrottlingState>, Failure>,
        mode: ThrottleEnqueue,
    ) -> bool {
        let done_sync = mode != ThrottleEnqueue::Async;
        match admitted {
            Ok(state) => {
                let properties = exchange.properties_mut();
                if properties.throttle_state.is_none() {
                    properties.throttle_state = Some(mode);
                }
                exchange.add_on_completion(Arc::new(PermitRelease {
                    state,
                    throttler: Arc::downgrade(self),
                    released: AtomicBool::new(false),
                }));
            }
            Err(failure) => exchange.set_exception(failure),
        }
        callback.done(exchange, done_sync);
        done_sync
    }

    fn schedule_cleanup(self: &Arc<Self>, state: &Arc<ThrottlingState>) {
        let Some(executor) = &self.executor else {
            return;
        };
        let throttler = Arc::downgrade(self);
        let key = state.key.clone();
        let scheduled = executor.schedule(
            self.options.cleanup_period,
            Box::new(move || {
                if let Some(throttler) = throttler.upgrade() {
                    throttler.cleanup(&key);
                }
            }),
        );
        match scheduled {
            Ok(handle) => {
                if let Some(previous) = state.cleanup.lock().replace(handle) {
                    previous.cancel();
                }
            }
            Err(rejected) => tracing::debug!(%rejected, "throttler state cleanup not scheduled"),
        }
    }

    fn cleanup(&self, key: &str) {
        if self.states.remove_if(key, |_, state| state.retire_if_idle()).is_some() {
            tracing::trace!(key, "removed idle throttling state");
        }
    }

    fn clear(&self) {
        for entry in self.states.iter() {
            entry.value().semaphore.close();
            if let Some(handle) = entry.value().cleanup.lock().take() {
                handle.cancel();
            }
        }
        self.states.clear();
    }
}

impl Service for Throttler {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.state)
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.inner.clear();
        Ok(())
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.inner.clear();
        if self.inner.options.shutdown_executor {
            if let Some(executor) = &self.inner.executor {
                executor.shutdown();
            }
        }
        Ok(())
    }
}

impl AsyncProcessor for Throttler {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.inner.throttle(exchange, callback, ThrottleEnqueue::Sync)
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::await_manager::process_sync;
    use sluice_core::{UnitOfWork, constant, header};

    fn admit(throttler: &Throttler, mut exchange: Exchange) -> (Exchange, Arc<UnitOfWork>) {
        let uow = UnitOfWork::start(&mut exchange);
        (process_sync(throttler, exchange).unwrap(), uow)
    }

    #[test]
    fn test_reject_beyond_limit() {
        let throttler = Throttler::builder(constant(3)).reject_execution(true).build();
        let mut held = Vec::new();
        let mut rejected = 0;
        for _ in 0..10 {
            let (ex, uow) = admit(&throttler, Exchange::new("x"));
            match ex.exception() {
                None => held.push((ex, uow)),
                Some(failure) => {
                    assert!(matches!(
                        failure.find::<RoutingError>(),
                        Some(RoutingError::ThrottlerRejected { max: 3 })
                    ));
                    rejected += 1;
                }
            }
        }
        assert_eq!(held.len(), 3);
        assert_eq!(rejected, 7);
        assert_eq!(held[0].0.properties().throttle_state, Some(ThrottleEnqueue::Sync));

        for (mut ex, uow) in held.drain(..) {
            uow.done(&mut ex);
        }
        for _ in 0..3 {
            let (ex, _uow) = admit(&throttler, Exchange::new("x"));
            assert!(!ex.is_failed());
        }
    }

    #[test]
    fn test_shrinking_does_not_revoke_permits() {
        let throttler = Throttler::builder(header("max")).reject_execution(true).build();
        let mut held: Vec<_> = (0..4)
            .map(|_| admit(&throttler, Exchange::new("x").with_header("max", 5)))
            .collect();
        assert!(held.iter().all(|(ex, _)| !ex.is_failed()));

        let (ex, _) = admit(&throttler, Exchange::new("x").with_header("max", 2));
        assert!(ex.is_failed());
        assert_eq!(throttler.current_max(), Some(2));

        for _ in 0..2 {
            let (mut ex, uow) = held.pop().unwrap();
            uow.done(&mut ex);
        }
        let (ex, _) = admit(&throttler, Exchange::new("x").with_header("max", 2));
        assert!(ex.is_failed());

        let (mut ex, uow) = held.pop().unwrap();
        uow.done(&mut ex);
        let (ex, _) = admit(&throttler, Exchange::new("x").with_header("max", 2));
        assert!(!ex.is_failed());
    }

    #[test]
    fn test_keys_are_throttled_separately() {
        let throttler = Throttler::builder(constant(1))
            .correlation(header("tenant"))
            .reject_execution(true)
            .build();
        let (a, _ua) = admit(&throttler, Exchange::new("x").with_header("tenant", "a"));
        let (b, _ub) = admit(&throttler, Exchange::new("x").with_header("tenant", "b"));
        assert!(!a.is_failed() && !b.is_failed());
        let mut keys = throttler.active_keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(throttler.current_max_concurrent_requests("a"), Some(1));
    }

    #[test]
    fn test_invalid_limit_fails_exchange() {
        let throttler = Throttler::builder(constant("many")).build();
        let (ex, _) = admit(&throttler, Exchange::new("x"));
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::Expression(_))
        ));
    }

    #[test]
    fn test_permit_released_once() {
        let throttler = Throttler::builder(constant(1)).build();
        let (mut ex, uow) = admit(&throttler, Exchange::new("x"));
        assert!(uow.done(&mut ex));
        assert!(!uow.done(&mut ex));
        let state = throttler.throttling_state(DEFAULT_KEY).unwrap();
        assert_eq!(state.available_permits(), 1);
        drop(ex);
        drop(uow);
        assert_eq!(state.available_permits(), 1);
    }

    #[test]
    fn test_exchange_without_unit_of_work_returns_permit_when_dropped() {
        let throttler = Throttler::builder(constant(1)).reject_execution(true).build();
        let ex = process_sync(&throttler, Exchange::new("a")).unwrap();
        assert_eq!(ex.pending_completions(), 1);
        let state = throttler.throttling_state(DEFAULT_KEY).unwrap();
        assert_eq!(state.available_permits(), 0);
        drop(ex);
        assert_eq!(state.available_permits(), 1);

        let mut ex = process_sync(&throttler, Exchange::new("b")).unwrap();
        assert_eq!(state.available_permits(), 0);
        ex.reset();
        assert_eq!(state.available_permits(), 1);
    }

    #[test]
    fn test_cleaned_up_state_hands_out_no_permits() {
        let throttler = Throttler::builder(constant(1)).reject_execution(true).build();
        let orphan = throttler.inner.state_for(DEFAULT_KEY.to_owned());
        orphan.set_max(1);
        throttler.inner.cleanup(DEFAULT_KEY);
        assert!(throttler.active_keys().is_empty());
        assert_eq!(orphan.semaphore.try_acquire(), Acquire::Retired);

        let (first, _first_uow) = admit(&throttler, Exchange::new("a"));
        assert!(!first.is_failed());
        let (second, _second_uow) = admit(&throttler, Exchange::new("b"));
        assert!(matches!(
            second.exception().and_then(|f| f.find::<RoutingError>()),
            Some(RoutingError::ThrottlerRejected { max: 1 })
        ));
    }

    #[test]
    fn test_busy_state_survives_cleanup() {
        let throttler = Throttler::builder(constant(1)).build();
        let (_held, _uow) = admit(&throttler, Exchange::new("a"));
        throttler.inner.cleanup(DEFAULT_KEY);
        let state = throttler.throttling_state(DEFAULT_KEY).unwrap();
        assert!(!state.semaphore.is_retired());
        assert_eq!(state.available_permits(), 0);
    }

    #[test]
    fn test_stop_clears_state() {
        let throttler = Throttler::builder(constant(1)).build();
        throttler.start().unwrap();
        let _held = admit(&throttler, Exchange::new("x"));
        throttler.stop().unwrap();
        assert!(throttler.active_keys().is_empty());
    }
}
