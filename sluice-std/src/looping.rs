//! Repeated processing of an exchange.
//!
//! A loop runs its body either a fixed number of times, computed once per
//! exchange, or for as long as a predicate holds. Iterations are resumed
//! from the reactive executor like pipeline steps.
//!
//! In copy mode every iteration works on a fresh correlated copy of the
//! original exchange and only the last iteration's result is copied back.
//! Otherwise the same exchange is mutated in place and each iteration's
//! output becomes the next iteration's input.

use crate::{
    exchange_factory::PooledExchangeFactory,
    helper::continue_processing,
    pool::{PoolOptions, PoolSnapshot, Pooled, PooledTask, TaskPool},
};
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Failure, RoutingError, Service,
    ServiceState, SharedExpression, SharedPredicate, SharedProcessor, ShutdownAware, reactive,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// How a loop decides to run another iteration.
#[derive(Clone)]
pub enum LoopMode {
    /// Runs as many times as the expression yields, evaluated once.
    Times(SharedExpression),
    /// Runs while the predicate matches, evaluated before every iteration.
    While(SharedPredicate),
}

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopOptions {
    /// Process a correlated copy of the original exchange per iteration.
    pub copy: bool,
    /// Stop starting iterations once shutdown has been requested.
    pub break_on_shutdown: bool,
}

struct Shared {
    mode: LoopMode,
    processor: SharedProcessor,
    options: LoopOptions,
    factory: PooledExchangeFactory,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
}

impl Shared {
    fn proceed(&self, index: usize, count: Option<usize>, subject: &Exchange) -> Result<bool, BoxError> {
        if self.options.break_on_shutdown && self.shutdown.load(Ordering::Acquire) {
            tracing::debug!(
                exchange_id = subject.exchange_id(),
                iterations = index,
                "loop breaking out due to shutdown"
            );
            return Ok(false);
        }
        if index > 0 && !continue_processing(subject, "so breaking out of loop") {
            return Ok(false);
        }
        match &self.mode {
            LoopMode::Times(_) => Ok(count.is_some_and(|count| index < count)),
            LoopMode::While(predicate) => predicate.matches(subject),
        }
    }
}

/// Per-exchange loop state.
#[derive(Default)]
pub struct LoopTask {
    original: Option<Exchange>,
    current: Option<Exchange>,
    callback: Option<AsyncCallback>,
    index: usize,
    count: Option<usize>,
    shared: Option<Arc<Shared>>,
}

impl PooledTask for LoopTask {
    fn reset(&mut self) {
        self.original = None;
        self.current = None;
        self.callback = None;
        self.index = 0;
        self.count = None;
        self.shared = None;
    }
}

/// Builds a [`Loop`].
pub struct LoopBuilder {
    mode: LoopMode,
    processor: SharedProcessor,
    options: LoopOptions,
    pool: PoolOptions,
    id: Option<String>,
}

impl LoopBuilder {
    /// Replaces all options.
    pub fn options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    /// Processes a correlated copy per iteration.
    pub fn copy(mut self, copy: bool) -> Self {
        self.options.copy = copy;
        self
    }

    /// Stops starting iterations once shutdown has been requested.
    pub fn break_on_shutdown(mut self, enabled: bool) -> Self {
        self.options.break_on_shutdown = enabled;
        self
    }

    /// Sizes the task and exchange pools.
    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the identifier used in logs.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builds the loop.
    pub fn build(self) -> Loop {
        Loop {
            shared: Arc::new(Shared {
                mode: self.mode,
                processor: self.processor,
                options: self.options,
                factory: PooledExchangeFactory::new(self.pool),
                shutdown: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            pool: TaskPool::new(self.pool),
            id: self.id,
            state: ServiceState::new(),
        }
    }
}

/// Repeats a processor over an exchange.
pub struct Loop {
    shared: Arc<Shared>,
    pool: Arc<TaskPool<LoopTask>>,
    id: Option<String>,
    state: ServiceState,
}

impl Loop {
    /// Runs `processor` as many times as `count` evaluates to.
    pub fn times(count: SharedExpression, processor: SharedProcessor) -> LoopBuilder {
        Self::builder(LoopMode::Times(count), processor)
    }

    /// Runs `processor` while `predicate` matches.
    pub fn do_while(predicate: SharedPredicate, processor: SharedProcessor) -> LoopBuilder {
        Self::builder(LoopMode::While(predicate), processor)
    }

    /// A builder for `mode`.
    pub fn builder(mode: LoopMode, processor: SharedProcessor) -> LoopBuilder {
        LoopBuilder {
            mode,
            processor,
            options: LoopOptions::default(),
            pool: PoolOptions::default(),
            id: None,
        }
    }

    /// The loop settings.
    pub fn options(&self) -> LoopOptions {
        self.shared.options
    }

    /// Counters of the copy pool.
    pub fn exchange_statistics(&self) -> PoolSnapshot {
        self.shared.factory.statistics()
    }

    fn iteration_count(&self, exchange: &Exchange) -> Result<Option<usize>, Failure> {
        let LoopMode::Times(expression) = &self.shared.mode else {
            return Ok(None);
        };
        let value = expression
            .evaluate(exchange)
            .map_err(|error| RoutingError::Expression(error.to_string()))?;
        let count = value.as_int().ok_or_else(|| {
            RoutingError::Expression(format!("loop count is not an integer: {value}"))
        })?;
        Ok(Some(usize::try_from(count).unwrap_or(0)))
    }
}

fn run(mut task: Pooled<LoopTask>) {
    let Some(shared) = task.shared.clone() else {
        return;
    };
    let last = task.current.take();
    let Some(subject) = last.as_ref().or(task.original.as_ref()) else {
        return;
    };
    match shared.proceed(task.index, task.count, subject) {
        Ok(true) => {}
        Ok(false) => return complete(task, &shared, last, None),
        Err(error) => {
            let failure = Failure::new(RoutingError::Expression(error.to_string()));
            return complete(task, &shared, last, Some(failure));
        }
    }

    let mut exchange = match (task.original.as_ref(), last) {
        (Some(original), last) => {
            if let Some(previous) = last {
                shared.factory.release_or_drop(previous);
            }
            shared.factory.create_correlated_copy(original, true)
        }
        (None, Some(mut current)) => {
            if task.index > 0 {
                current.prepare_out_to_in();
            }
            current
        }
        (None, None) => return,
    };
    exchange.properties_mut().loop_index = Some(task.index);
    exchange.properties_mut().loop_size = task.count;
    tracing::trace!(
        exchange_id = exchange.exchange_id(),
        iteration = task.index,
        "loop iteration"
    );
    task.index += 1;
    let processor = Arc::clone(&shared.processor);
    processor.process(
        exchange,
        AsyncCallback::new(move |exchange, _| {
            task.current = Some(exchange);
            reactive::schedule(move || run(task));
        }),
    );
}

fn complete(
    mut task: Pooled<LoopTask>,
    shared: &Shared,
    last: Option<Exchange>,
    failure: Option<Failure>,
) {
    let result = match task.original.take() {
        Some(mut original) => {
            if let Some(last) = last {
                original.copy_results_from(&last);
                shared.factory.release_or_drop(last);
            }
            Some(original)
        }
        None => last,
    };
    let callback = task.callback.take();
    drop(task);
    shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    if let (Some(mut exchange), Some(callback)) = (result, callback) {
        exchange.prepare_out_to_in();
        if let Some(failure) = failure {
            exchange.set_exception(failure);
        }
        reactive::schedule(move || callback.done(exchange, false));
    }
}

impl Service for Loop {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.state)
    }

    fn do_build(&self) -> Result<(), BoxError> {
        self.shared.processor.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.shared.processor.init()
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.shared.shutdown.store(false, Ordering::Release);
        self.shared.processor.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.shared.processor.stop()
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.shared.processor.shutdown()
    }
}

impl ShutdownAware for Loop {
    fn prepare_shutdown(&self, suspend_only: bool, forced: bool) {
        tracing::debug!(suspend_only, forced, "loop preparing for shutdown");
        self.shared.shutdown.store(true, Ordering::Release);
    }

    fn pending_exchanges(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

impl AsyncProcessor for Loop {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let count = match self.iteration_count(&exchange) {
            Ok(count) => count,
            Err(failure) => {
                exchange.set_exception(failure);
                callback.done(exchange, true);
                return true;
            }
        };
        if count.is_some() {
            exchange.properties_mut().loop_size = count;
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let transacted = exchange.is_transacted();
        let mut task = self.pool.acquire(LoopTask::default);
        if self.shared.options.copy {
            task.original = Some(exchange);
        } else {
            task.current = Some(exchange);
        }
        task.callback = Some(callback);
        task.count = count;
        task.shared = Some(Arc::clone(&self.shared));
        if transacted {
            reactive::schedule_sync(move || run(task));
        } else {
            reactive::schedule_main(move || run(task));
        }
        false
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{await_manager::process_sync, testing::RecordingProcessor};
    use sluice_core::{Value, constant, predicate, processor};

    fn append_index() -> SharedProcessor {
        processor(|ex| {
            let index = ex.properties().loop_index.unwrap_or_default();
            let body = format!("{}{index}", ex.body());
            ex.output_mut().set_body(body);
            Ok(())
        })
    }

    #[test]
    fn test_in_place_loop_chains_iterations() {
        let looping = Loop::times(constant(3), append_index()).build();
        let ex = process_sync(&looping, Exchange::new("x")).unwrap();
        assert_eq!(ex.body().to_text(), "x012");
        assert_eq!(ex.properties().loop_size, Some(3));
        assert_eq!(looping.pending_exchanges(), 0);
    }

    #[test]
    fn test_copy_loop_uses_fresh_copies() {
        let recorder = RecordingProcessor::new();
        let body = crate::pipeline::Pipeline::new(vec![append_index(), recorder.shared()]);
        let looping = Loop::times(constant(3), sluice_core::shared(body))
            .copy(true)
            .build();
        let original = Exchange::new("x");
        let id = original.exchange_id().to_owned();
        let ex = process_sync(&looping, original).unwrap();

        assert_eq!(
            recorder.bodies(),
            vec![Value::from("x0"), Value::from("x1"), Value::from("x2")]
        );
        assert_eq!(ex.exchange_id(), id);
        assert_eq!(ex.body().to_text(), "x2");
        let ids = recorder.exchange_ids();
        assert!(!ids.contains(&id));
        let stats = looping.exchange_statistics();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_do_while_reevaluates() {
        let increment = processor(|ex| {
            let n = ex.body().as_int().unwrap_or(0);
            ex.set_body(n + 1);
            Ok(())
        });
        let looping = Loop::do_while(
            predicate(|ex| ex.body().as_int().is_some_and(|n| n < 5)),
            increment,
        )
        .build();
        let ex = process_sync(&looping, Exchange::new(0)).unwrap();
        assert_eq!(ex.body(), &Value::Int(5));
        assert_eq!(ex.properties().loop_size, None);
    }

    #[test]
    fn test_failure_stops_loop() {
        let recorder = RecordingProcessor::new();
        let failing = processor(|ex| {
            if ex.properties().loop_index == Some(1) {
                return Err("stop here".into());
            }
            Ok(())
        });
        let body = crate::pipeline::Pipeline::new(vec![recorder.shared(), failing]);
        let looping = Loop::times(constant(5), sluice_core::shared(body)).build();
        let ex = process_sync(&looping, Exchange::new("x")).unwrap();
        assert_eq!(recorder.count(), 2);
        assert!(ex.is_failed());
    }

    #[test]
    fn test_invalid_count_fails() {
        let looping = Loop::times(constant("many"), append_index()).build();
        let ex = process_sync(&looping, Exchange::new("x")).unwrap();
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::Expression(_))
        ));
    }

    #[test]
    fn test_break_on_shutdown() {
        let recorder = RecordingProcessor::new();
        let looping = Loop::times(constant(10), recorder.shared())
            .break_on_shutdown(true)
            .build();
        looping.prepare_shutdown(false, false);
        let ex = process_sync(&looping, Exchange::new("x")).unwrap();
        assert_eq!(recorder.count(), 0);
        assert!(!ex.is_failed());
    }
}
