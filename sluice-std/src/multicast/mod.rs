//! Fan-out of one exchange to many processors with result aggregation.
//!
//! [`MulticastProcessor`] is the engine shared by [`Multicast`], the
//! splitter and the recipient list. Each of them supplies a
//! [`BranchSource`] describing which processor gets which correlated copy;
//! branch dispatch, completion ordering, aggregation, timeouts and the
//! final copy back onto the original exchange live here.
//!
//! # Execution modes
//!
//! - Sequential: one branch at a time, the next branch is dispatched from
//!   the previous branch's completion through the reactive executor.
//! - Parallel: every dispatch is submitted to the configured
//!   [`ExecutorService`](sluice_core::ExecutorService); branches complete
//!   in any order.
//! - Transacted: a transacted exchange without parallel processing runs
//!   every branch to completion on the calling thread in a loop.
//!
//! Branches are aggregated in dispatch order unless `streaming` is set, in
//! which case they are aggregated as they complete.

mod completion;
mod pair;

pub use completion::CompletionQueue;
pub use pair::{PairHooks, Pairs, ProcessorExchangePair};

use crate::{
    await_manager::{await_callback, process_sync},
    exchange_factory::PooledExchangeFactory,
    helper::continue_processing,
    internal::{Advice, InternalProcessor, UnitOfWorkAdvice},
    pool::{PoolOptions, PoolSnapshot},
};
use dashmap::DashMap;
use pair::Branch;
use parking_lot::Mutex;
use sluice_core::{
    AggregationStrategy, AsyncCallback, AsyncProcessor, BoxError, ErrorHandlerFactory, Exchange,
    Failure, Processor, RejectedExecution, RoutingError, ScheduledHandle, Service, ServiceState,
    SharedAggregationStrategy, SharedExecutor, SharedProcessor, Value, processor_key, reactive,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Behaviour switches of a multicast.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MulticastOptions {
    /// Dispatch branches concurrently on the executor service.
    pub parallel_processing: bool,
    /// Trust the aggregation strategy to be thread safe.
    pub parallel_aggregate: bool,
    /// Aggregate in completion order instead of dispatch order.
    pub streaming: bool,
    /// Stop at the first failed branch.
    pub stop_on_exception: bool,
    /// Let branch copies share the unit of work of the original.
    pub share_unit_of_work: bool,
    /// Stop waiting for branches after this long.
    pub timeout: Option<Duration>,
    /// Complete on the calling thread, blocking until all branches are done.
    pub synchronous: bool,
    /// Sizing of the branch exchange pool.
    pub pool: PoolOptions,
}

struct ContextInner {
    factory: PooledExchangeFactory,
    parallel: bool,
    streaming: bool,
    share_unit_of_work: bool,
    on_prepare: Option<Arc<dyn Processor>>,
    error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
    prepared: DashMap<usize, SharedProcessor>,
}

/// What a [`BranchSource`] needs to build its pairs.
#[derive(Clone)]
pub struct BranchContext {
    inner: Arc<ContextInner>,
}

impl BranchContext {
    fn new(
        options: &MulticastOptions,
        on_prepare: Option<Arc<dyn Processor>>,
        error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                factory: PooledExchangeFactory::new(options.pool),
                parallel: options.parallel_processing,
                streaming: options.streaming,
                share_unit_of_work: options.share_unit_of_work,
                on_prepare,
                error_handler,
                prepared: DashMap::new(),
            }),
        }
    }

    /// Creates the correlated copy for branch `index`.
    ///
    /// In parallel mode every branch after the first gets its own copy of
    /// a stream body, since a stream can be read only once.
    pub fn copy(&self, parent: &Exchange, index: usize) -> Exchange {
        let mut copy = self
            .inner
            .factory
            .create_correlated_copy(parent, self.inner.share_unit_of_work);
        if self.inner.parallel && index > 0 {
            let independent = match copy.body() {
                Value::Stream(stream) => Some(stream.copy()),
                _ => None,
            };
            if let Some(stream) = independent {
                copy.set_body(stream);
            }
        }
        copy
    }

    /// Builds the pair for `processor` and its branch `exchange`.
    ///
    /// `cacheable` processors are wrapped once and the wrapper is reused;
    /// dynamically created producers are wrapped every time.
    pub fn pair(
        &self,
        index: usize,
        processor: SharedProcessor,
        exchange: Exchange,
        cacheable: bool,
    ) -> Result<ProcessorExchangePair, BoxError> {
        let prepared = self.prepare(&processor, cacheable)?;
        let mut exchange = exchange;
        if let Some(on_prepare) = &self.inner.on_prepare {
            on_prepare.process(&mut exchange)?;
        }
        Ok(ProcessorExchangePair::new(
            index, processor, prepared, exchange,
        ))
    }

    fn prepare(
        &self,
        processor: &SharedProcessor,
        cacheable: bool,
    ) -> Result<SharedProcessor, BoxError> {
        let key = processor_key(processor);
        if cacheable {
            if let Some(prepared) = self.inner.prepared.get(&key) {
                return Ok(Arc::clone(prepared.value()));
            }
        }
        let handled = match &self.inner.error_handler {
            Some(factory) => factory.wrap(Arc::clone(processor))?,
            None => Arc::clone(processor),
        };
        let advices: Vec<Arc<dyn Advice>> = vec![Arc::new(UnitOfWorkAdvice::new())];
        let prepared: SharedProcessor = Arc::new(InternalProcessor::new(handled, advices));
        if cacheable {
            let entry = self.inner.prepared.entry(key).or_insert(prepared);
            return Ok(Arc::clone(entry.value()));
        }
        Ok(prepared)
    }

    /// The factory branch copies are drawn from.
    pub fn factory(&self) -> &PooledExchangeFactory {
        &self.inner.factory
    }

    /// Returns true when branches run in parallel.
    pub fn is_parallel(&self) -> bool {
        self.inner.parallel
    }

    /// Returns true when branches are created and aggregated as they go.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming
    }

    /// Number of cached wrapped processors.
    pub fn prepared_count(&self) -> usize {
        self.inner.prepared.len()
    }
}

impl fmt::Debug for BranchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchContext")
            .field("factory", &self.inner.factory)
            .field("parallel", &self.inner.parallel)
            .field("prepared", &self.inner.prepared.len())
            .finish_non_exhaustive()
    }
}

/// Describes the branches of a multicast.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot supply multicast branches",
    label = "missing `BranchSource` implementation",
    note = "Use `StaticBranches` to multicast to a fixed list of processors."
)]
pub trait BranchSource: Service + Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Creates the pairs for `exchange`. An error fails the exchange.
    fn branches(&self, context: &BranchContext, exchange: &Exchange) -> Result<Pairs, BoxError>;

    /// Stamps the branch exchange before it is dispatched.
    fn update_branch(
        &self,
        exchange: &mut Exchange,
        index: usize,
        has_next: bool,
        _size: Option<usize>,
    ) {
        let properties = exchange.properties_mut();
        properties.multicast_index = Some(index);
        properties.multicast_complete = Some(!has_next);
    }

    /// Strategy used when none is configured.
    fn default_strategy(&self) -> Option<SharedAggregationStrategy> {
        None
    }
}

/// A fixed list of processors, each receiving its own copy.
pub struct StaticBranches {
    processors: Vec<SharedProcessor>,
}

impl StaticBranches {
    /// Branches to `processors` in order.
    pub fn new(processors: Vec<SharedProcessor>) -> Self {
        Self { processors }
    }

    /// The branch processors.
    pub fn processors(&self) -> &[SharedProcessor] {
        &self.processors
    }
}

impl Service for StaticBranches {
    fn do_build(&self) -> Result<(), BoxError> {
        self.processors.iter().try_for_each(|p| p.build())
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.processors.iter().try_for_each(|p| p.init())
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.processors.iter().try_for_each(|p| p.start())
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.processors.iter().rev().try_for_each(|p| p.stop())
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.processors.iter().rev().try_for_each(|p| p.shutdown())
    }
}

impl BranchSource for StaticBranches {
    fn name(&self) -> &'static str {
        "multicast"
    }

    fn branches(&self, context: &BranchContext, exchange: &Exchange) -> Result<Pairs, BoxError> {
        let pairs = self
            .processors
            .iter()
            .enumerate()
            .map(|(index, processor)| {
                let copy = context.copy(exchange, index);
                context.pair(index, Arc::clone(processor), copy, true)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pairs::from_vec(pairs))
    }
}

/// Multicast to a fixed list of processors.
pub type Multicast = MulticastProcessor<StaticBranches>;

struct Inner<S> {
    source: S,
    strategy: Option<SharedAggregationStrategy>,
    options: MulticastOptions,
    executor: Option<SharedExecutor>,
    context: BranchContext,
    monitor: Mutex<()>,
    in_flight: AtomicUsize,
    id: Option<String>,
    state: ServiceState,
}

/// The fan-out engine.
pub struct MulticastProcessor<S> {
    inner: Arc<Inner<S>>,
}

/// Builder for [`MulticastProcessor`].
pub struct MulticastBuilder<S> {
    source: S,
    strategy: Option<SharedAggregationStrategy>,
    options: MulticastOptions,
    executor: Option<SharedExecutor>,
    on_prepare: Option<Arc<dyn Processor>>,
    error_handler: Option<Arc<dyn ErrorHandlerFactory>>,
    id: Option<String>,
}

impl<S: BranchSource> MulticastBuilder<S> {
    /// Starts a builder for `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            strategy: None,
            options: MulticastOptions::default(),
            executor: None,
            on_prepare: None,
            error_handler: None,
            id: None,
        }
    }

    /// Sets the aggregation strategy.
    pub fn strategy(self, strategy: impl AggregationStrategy) -> Self {
        self.shared_strategy(Arc::new(strategy))
    }

    /// Sets a shared aggregation strategy.
    pub fn shared_strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Replaces all options.
    pub fn options(mut self, options: MulticastOptions) -> Self {
        self.options = options;
        self
    }

    /// Dispatches branches concurrently.
    pub fn parallel_processing(mut self, enabled: bool) -> Self {
        self.options.parallel_processing = enabled;
        self
    }

    /// Lets aggregation run without the processor-wide monitor.
    pub fn parallel_aggregate(mut self, enabled: bool) -> Self {
        self.options.parallel_aggregate = enabled;
        self
    }

    /// Aggregates in completion order.
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.options.streaming = enabled;
        self
    }

    /// Stops at the first failed branch.
    pub fn stop_on_exception(mut self, enabled: bool) -> Self {
        self.options.stop_on_exception = enabled;
        self
    }

    /// Shares the original's unit of work with branch copies.
    pub fn share_unit_of_work(mut self, enabled: bool) -> Self {
        self.options.share_unit_of_work = enabled;
        self
    }

    /// Stops waiting for branches after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Completes on the calling thread.
    pub fn synchronous(mut self, enabled: bool) -> Self {
        self.options.synchronous = enabled;
        self
    }

    /// Sets the executor service for parallel dispatch and timeouts.
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Runs `processor` on each branch copy before it is dispatched.
    pub fn on_prepare(mut self, processor: impl Processor) -> Self {
        self.on_prepare = Some(Arc::new(processor));
        self
    }

    /// Wraps every branch processor in an error handler.
    pub fn error_handler(mut self, factory: Arc<dyn ErrorHandlerFactory>) -> Self {
        self.error_handler = Some(factory);
        self
    }

    /// Sets the identifier used in logs.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builds the processor.
    pub fn build(self) -> MulticastProcessor<S> {
        let strategy = self.strategy.or_else(|| self.source.default_strategy());
        let context = BranchContext::new(&self.options, self.on_prepare, self.error_handler);
        MulticastProcessor {
            inner: Arc::new(Inner {
                source: self.source,
                strategy,
                options: self.options,
                executor: self.executor,
                context,
                monitor: Mutex::new(()),
                in_flight: AtomicUsize::new(0),
                id: self.id,
                state: ServiceState::new(),
            }),
        }
    }
}

impl MulticastProcessor<StaticBranches> {
    /// Starts building a multicast to `processors`.
    pub fn builder(processors: Vec<SharedProcessor>) -> MulticastBuilder<StaticBranches> {
        MulticastBuilder::new(StaticBranches::new(processors))
    }
}

impl<S: BranchSource> MulticastProcessor<S> {
    /// The branch source.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// The configured options.
    pub fn options(&self) -> &MulticastOptions {
        &self.inner.options
    }

    /// The aggregation strategy in use, if any.
    pub fn strategy(&self) -> Option<&SharedAggregationStrategy> {
        self.inner.strategy.as_ref()
    }

    /// Counters of the branch exchange pool.
    pub fn exchange_statistics(&self) -> PoolSnapshot {
        self.inner.context.factory().statistics()
    }

    /// Number of idle pooled branch exchanges.
    pub fn exchange_pool_size(&self) -> usize {
        self.inner.context.factory().size()
    }

    /// Number of cached wrapped branch processors.
    pub fn prepared_processors(&self) -> usize {
        self.inner.context.prepared_count()
    }

    /// Number of exchanges currently being multicast.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

impl<S: BranchSource> Inner<S> {
    fn needs_executor(&self) -> bool {
        self.options.parallel_processing || self.options.timeout.is_some()
    }

    fn no_executor(&self) -> RoutingError {
        RoutingError::Rejected(RejectedExecution::new(
            self.source.name(),
            "parallel processing and timeout require an executor service",
        ))
    }

    fn do_process(self: &Arc<Self>, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.needs_executor() && self.executor.is_none() {
            exchange.set_exception(self.no_executor());
            callback.done(exchange, true);
            return true;
        }
        let pairs = match self.source.branches(&self.context, &exchange) {
            Ok(pairs) => pairs,
            Err(error) => {
                exchange.set_exception(Failure::from_boxed(error));
                self.finish(&mut exchange, None, false);
                callback.done(exchange, true);
                return true;
            }
        };

        let transacted = exchange.is_transacted();
        let task = Arc::new(MulticastTask::new(Arc::clone(self), exchange, callback, pairs));
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        if let (Some(timeout), Some(executor)) = (self.options.timeout, &self.executor) {
            let weak = Arc::downgrade(&task);
            let scheduled = executor.schedule(
                timeout,
                Box::new(move || {
                    if let Some(task) = weak.upgrade() {
                        task.on_timeout();
                    }
                }),
            );
            match scheduled {
                Ok(handle) => *task.timeout.lock() = Some(handle),
                Err(rejected) => {
                    task.fail(Failure::new(RoutingError::Rejected(rejected)));
                    return false;
                }
            }
        }

        if self.options.parallel_processing {
            task.schedule_next();
        } else if transacted {
            if reactive::is_running() {
                reactive::schedule_queue(move || task.run_transacted());
            } else {
                reactive::schedule_sync(move || task.run_transacted());
            }
        } else {
            reactive::schedule_main(move || task.run());
        }
        false
    }

    /// Copies the outcome onto the original exchange.
    fn finish(&self, original: &mut Exchange, sub: Option<Exchange>, force_exhaust: bool) {
        if let Some(strategy) = &self.strategy {
            strategy.on_completion(sub.as_ref(), original);
        }
        let exhaust = force_exhaust
            || sub
                .as_ref()
                .is_some_and(|s| s.is_failed() || s.is_redelivery_exhausted());
        let exception = original.is_failed() || sub.as_ref().is_some_and(Exchange::is_failed);
        let stopped = exception && self.options.stop_on_exception;

        if let Some(sub) = sub {
            if stopped {
                original.replace_exception(sub.exception().cloned());
            } else {
                let correlation_id = original.properties_mut().correlation_id.take();
                original.copy_results_from(&sub);
                original.properties_mut().correlation_id = correlation_id;
            }
            self.context.factory().release_or_drop(sub);
        }
        if exception {
            original.set_redelivery_exhausted(exhaust);
        }
    }
}

impl<S: BranchSource> Service for MulticastProcessor<S> {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.inner.state)
    }

    fn do_build(&self) -> Result<(), BoxError> {
        self.inner.source.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.inner.source.init()
    }

    fn do_start(&self) -> Result<(), BoxError> {
        if self.inner.needs_executor() && self.inner.executor.is_none() {
            return Err(self.inner.no_executor().into());
        }
        self.inner.source.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.inner.source.stop()
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.inner.source.shutdown()
    }
}

impl<S: BranchSource> AsyncProcessor for MulticastProcessor<S> {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        if !self.inner.options.synchronous {
            return self.inner.do_process(exchange, callback);
        }
        let inner = Arc::clone(&self.inner);
        let exchange = match await_callback(move |cb| inner.do_process(exchange, cb)) {
            Ok(exchange) => exchange,
            Err(dropped) => {
                tracing::warn!(source = self.inner.source.name(), "{dropped}");
                let mut exchange = Exchange::default();
                exchange.set_exception(dropped);
                exchange
            }
        };
        callback.done(exchange, true);
        true
    }

    fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }
}

enum Next {
    Pair(ProcessorExchangePair, bool),
    Exhausted,
    Failed(BoxError),
}

/// The state of one exchange being multicast.
struct MulticastTask<S> {
    inner: Arc<Inner<S>>,
    original: Mutex<Option<Exchange>>,
    callback: Mutex<Option<AsyncCallback>>,
    pairs: Mutex<Option<Pairs>>,
    size: Option<usize>,
    completion: Mutex<CompletionQueue>,
    result: Mutex<Option<Exchange>>,
    sent: AtomicUsize,
    aggregated: AtomicUsize,
    all_sent: AtomicBool,
    done: AtomicBool,
    timeout: Mutex<Option<ScheduledHandle>>,
}

impl<S: BranchSource> MulticastTask<S> {
    fn new(inner: Arc<Inner<S>>, original: Exchange, callback: AsyncCallback, pairs: Pairs) -> Self {
        let completion = if inner.options.streaming {
            CompletionQueue::streaming()
        } else {
            CompletionQueue::ordered()
        };
        Self {
            size: pairs.size(),
            inner,
            original: Mutex::new(Some(original)),
            callback: Mutex::new(Some(callback)),
            pairs: Mutex::new(Some(pairs)),
            completion: Mutex::new(completion),
            result: Mutex::new(None),
            sent: AtomicUsize::new(0),
            aggregated: AtomicUsize::new(0),
            all_sent: AtomicBool::new(false),
            done: AtomicBool::new(false),
            timeout: Mutex::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn is_complete(&self) -> bool {
        !self.is_done()
            && self.all_sent.load(Ordering::Acquire)
            && self.aggregated.load(Ordering::Acquire) >= self.sent.load(Ordering::Acquire)
    }

    fn release(&self, exchange: Exchange) {
        self.inner.context.factory().release_or_drop(exchange);
    }

    fn next_pair(&self) -> Next {
        let mut guard = self.pairs.lock();
        let Some(pairs) = guard.as_mut() else {
            return Next::Exhausted;
        };
        match pairs.next() {
            Some(Ok(pair)) => {
                let has_next = pairs.has_next();
                Next::Pair(pair, has_next)
            }
            Some(Err(error)) => Next::Failed(error),
            None => Next::Exhausted,
        }
    }

    fn prepare_branch(
        &self,
        pair: ProcessorExchangePair,
        has_next: bool,
    ) -> (Branch, Exchange, usize) {
        let index = self.sent.fetch_add(1, Ordering::AcqRel);
        let (branch, mut exchange) = pair.into_parts();
        self.inner
            .source
            .update_branch(&mut exchange, index, has_next, self.size);
        if !has_next {
            self.all_sent.store(true, Ordering::Release);
        }
        if !self.inner.options.parallel_processing {
            if let Value::Stream(stream) = exchange.body() {
                stream.reset();
            }
        }
        (branch, exchange, index)
    }

    /// Dispatches the next branch from the reactive executor.
    fn run(self: Arc<Self>) {
        if self.is_done() {
            return;
        }
        let (pair, has_next) = match self.next_pair() {
            Next::Pair(pair, has_next) => (pair, has_next),
            Next::Exhausted => {
                self.all_sent.store(true, Ordering::Release);
                self.aggregate();
                return;
            }
            Next::Failed(error) => {
                self.fail(Failure::from_boxed(error));
                return;
            }
        };
        let (mut branch, exchange, index) = self.prepare_branch(pair, has_next);
        tracing::trace!(
            source = self.inner.source.name(),
            index,
            exchange_id = exchange.exchange_id(),
            "dispatching branch"
        );
        branch.begin();
        let prepared = Arc::clone(&branch.prepared);
        let task = Arc::clone(&self);
        prepared.process(
            exchange,
            AsyncCallback::new(move |exchange, _| task.branch_done(branch, index, has_next, exchange)),
        );
        if has_next && self.inner.options.parallel_processing {
            self.schedule_next();
        }
    }

    /// Runs every branch to completion on the current thread.
    fn run_transacted(self: Arc<Self>) {
        loop {
            if self.is_done() {
                return;
            }
            let (pair, has_next) = match self.next_pair() {
                Next::Pair(pair, has_next) => (pair, has_next),
                Next::Exhausted => {
                    self.all_sent.store(true, Ordering::Release);
                    self.aggregate();
                    return;
                }
                Next::Failed(error) => {
                    self.fail(Failure::from_boxed(error));
                    return;
                }
            };
            let (mut branch, exchange, index) = self.prepare_branch(pair, has_next);
            branch.begin();
            let exchange = match process_sync(branch.prepared.as_ref(), exchange) {
                Ok(exchange) => exchange,
                Err(dropped) => {
                    self.fail(Failure::new(dropped));
                    return;
                }
            };
            branch.done(&exchange);
            if self.stopped_on(index, exchange).is_some() {
                return;
            }
            self.aggregate();
            if !has_next {
                return;
            }
        }
    }

    fn schedule_next(self: &Arc<Self>) {
        if !self.inner.options.parallel_processing {
            let task = Arc::clone(self);
            reactive::schedule(move || task.run());
            return;
        }
        let Some(executor) = &self.inner.executor else {
            self.fail(Failure::new(self.inner.no_executor()));
            return;
        };
        let task = Arc::clone(self);
        let submitted = executor.submit(Box::new(move || reactive::schedule(move || task.run())));
        if let Err(rejected) = submitted {
            self.fail(Failure::new(RoutingError::Rejected(rejected)));
        }
    }

    fn branch_done(self: Arc<Self>, mut branch: Branch, index: usize, has_next: bool, exchange: Exchange) {
        branch.done(&exchange);
        if self.stopped_on(index, exchange).is_some() {
            return;
        }
        self.aggregate();
        if has_next && !self.inner.options.parallel_processing {
            self.schedule_next();
        }
    }

    /// Queues a completed branch, or finishes the multicast when it failed
    /// and `stop_on_exception` is set. Returns `Some` when the branch was
    /// not queued.
    fn stopped_on(&self, index: usize, mut exchange: Exchange) -> Option<()> {
        if self.is_done() {
            tracing::trace!(index, "branch completed after the multicast was done");
            self.release(exchange);
            return Some(());
        }
        if self.inner.options.stop_on_exception
            && !continue_processing(&exchange, "multicast stops on exception")
        {
            if let Some(failure) = exchange.take_exception() {
                tracing::debug!(
                    source = self.inner.source.name(),
                    index,
                    %failure,
                    "multicast processing failed"
                );
                exchange.set_exception(RoutingError::MulticastFailed {
                    index,
                    source: Arc::clone(failure.cause()),
                });
            }
            if self.mark_done() {
                self.complete(Some(exchange), true);
            } else {
                self.release(exchange);
            }
            return Some(());
        }
        // Checked again under the queue lock: `complete` drains the queue
        // only after the task is marked done.
        let mut completion = self.completion.lock();
        if self.is_done() {
            drop(completion);
            tracing::trace!(index, "branch completed after the multicast was done");
            self.release(exchange);
            return Some(());
        }
        completion.push(index, exchange);
        None
    }

    fn do_aggregate(&self, result: &mut Option<Exchange>, exchange: Exchange) -> Result<(), BoxError> {
        let Some(strategy) = &self.inner.strategy else {
            self.release(exchange);
            return Ok(());
        };
        let _monitor = (!self.inner.options.parallel_aggregate).then(|| self.inner.monitor.lock());
        let original = self.original.lock();
        let Some(input) = original.as_ref() else {
            self.release(exchange);
            return Ok(());
        };
        let merged = strategy.aggregate(result.take(), exchange, input)?;
        *result = Some(merged);
        Ok(())
    }

    /// Drains the completion queue unless another thread already is.
    fn aggregate(&self) {
        loop {
            let finished = {
                let Some(mut result) = self.result.try_lock() else {
                    return;
                };
                while !self.is_done() {
                    let next = self.completion.lock().poll();
                    let Some((_, exchange)) = next else {
                        break;
                    };
                    if let Err(error) = self.do_aggregate(&mut result, exchange) {
                        drop(result);
                        self.fail(Failure::new(RoutingError::Aggregation(Arc::from(error))));
                        return;
                    }
                    self.aggregated.fetch_add(1, Ordering::AcqRel);
                }
                if self.is_complete() && self.mark_done() {
                    Some(result.take())
                } else {
                    None
                }
            };
            if let Some(result) = finished {
                self.complete(result, true);
                return;
            }
            // A completion may have been queued while the lock was held.
            if self.is_done() || !(self.completion.lock().has_ready() || self.is_complete()) {
                return;
            }
        }
    }

    fn on_timeout(&self) {
        if self.is_done() {
            return;
        }
        let timeout = self.inner.options.timeout.unwrap_or_default();
        let outcome = {
            let mut result = self.result.lock();
            let total = self.sent.load(Ordering::Acquire);
            let mut failure = None;
            while !self.is_done() && self.aggregated.load(Ordering::Acquire) < total {
                let next = self.completion.lock().poll_unordered();
                let index = next.as_ref().map_or(total, |(index, _)| *index);
                while self.aggregated.load(Ordering::Acquire) < index {
                    let missing = self.aggregated.fetch_add(1, Ordering::AcqRel);
                    if let Some(strategy) = &self.inner.strategy {
                        *result = strategy.timeout(result.take(), missing, total, timeout);
                    }
                }
                if let Some((_, exchange)) = next {
                    if let Err(error) = self.do_aggregate(&mut result, exchange) {
                        failure = Some(error);
                        break;
                    }
                    self.aggregated.fetch_add(1, Ordering::AcqRel);
                }
            }
            match failure {
                Some(error) => Err(error),
                None if self.mark_done() => Ok(Some(result.take())),
                None => Ok(None),
            }
        };
        match outcome {
            Ok(Some(result)) => {
                tracing::debug!(
                    source = self.inner.source.name(),
                    ?timeout,
                    "multicast timed out"
                );
                self.complete(result, true);
            }
            Ok(None) => {}
            Err(error) => self.fail(Failure::new(RoutingError::Aggregation(Arc::from(error)))),
        }
    }

    fn fail(&self, failure: Failure) {
        if !self.mark_done() {
            return;
        }
        if let Some(original) = self.original.lock().as_mut() {
            original.set_exception(failure);
        }
        self.complete(None, false);
    }

    /// Ends the multicast. Must only be called by the caller that marked
    /// the task done.
    fn complete(&self, sub: Option<Exchange>, force_exhaust: bool) {
        if let Some(handle) = self.timeout.lock().take() {
            handle.cancel();
        }
        let original = self.original.lock().take();
        let callback = self.callback.lock().take();
        let leftover = self.result.lock().take();
        if let Some(leftover) = leftover {
            self.release(leftover);
        }
        let pending = self.completion.lock().drain();
        for exchange in pending {
            self.release(exchange);
        }
        if let Some(mut pairs) = self.pairs.lock().take() {
            pairs.close();
        }
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);

        let Some(mut original) = original else {
            return;
        };
        self.inner.finish(&mut original, sub, force_exhaust);
        if let Some(callback) = callback {
            reactive::schedule(move || callback.done(original, false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::await_manager::process_sync;
    use sluice_core::processor;

    fn concat(old: Option<Exchange>, new: Exchange) -> Result<Exchange, BoxError> {
        match old {
            None => Ok(new),
            Some(mut old) => {
                let body = format!("{}+{}", old.body(), new.body());
                old.set_body(body);
                Ok(old)
            }
        }
    }

    fn tag(name: &'static str) -> SharedProcessor {
        processor(move |ex| {
            let body = format!("{}:{name}", ex.body());
            ex.set_body(body);
            Ok(())
        })
    }

    #[test]
    fn test_sequential_aggregates_in_dispatch_order() {
        let multicast = Multicast::builder(vec![tag("a"), tag("b"), tag("c")])
            .strategy(concat)
            .build();
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert_eq!(ex.body().to_text(), "x:a+x:b+x:c");
        assert_eq!(multicast.in_flight(), 0);
    }

    #[test]
    fn test_without_strategy_original_is_kept() {
        let multicast = Multicast::builder(vec![tag("a")]).build();
        let original = Exchange::new("x");
        let id = original.exchange_id().to_owned();
        let ex = process_sync(&multicast, original).unwrap();
        assert_eq!(ex.body().to_text(), "x");
        assert_eq!(ex.exchange_id(), id);
        assert!(ex.properties().correlation_id.is_none());
    }

    #[test]
    fn test_branches_are_stamped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let record = processor(move |ex| {
            let p = ex.properties();
            s.lock().push((p.multicast_index, p.multicast_complete));
            Ok(())
        });
        let multicast = Multicast::builder(vec![record.clone(), record]).build();
        process_sync(&multicast, Exchange::new("x")).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![(Some(0), Some(false)), (Some(1), Some(true))]
        );
    }

    #[test]
    fn test_stop_on_exception_skips_remaining_branches() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let after = processor(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let multicast = Multicast::builder(vec![
            tag("a"),
            processor(|_| Err("branch broke".into())),
            after,
        ])
        .strategy(concat)
        .stop_on_exception(true)
        .build();
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let failure = ex.exception().unwrap();
        assert!(matches!(
            failure.find::<RoutingError>(),
            Some(RoutingError::MulticastFailed { index: 1, .. })
        ));
        assert_eq!(failure.chain().last().unwrap().to_string(), "branch broke");
        assert!(ex.is_redelivery_exhausted());
    }

    #[test]
    fn test_failed_branch_is_aggregated_without_stop() {
        let multicast = Multicast::builder(vec![processor(|_| Err("broke".into())), tag("b")])
            .strategy(|old: Option<Exchange>, new: Exchange| -> Result<Exchange, BoxError> {
                Ok(old.unwrap_or(new))
            })
            .build();
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert_eq!(ex.exception().map(ToString::to_string).as_deref(), Some("broke"));
    }

    #[test]
    fn test_aggregation_error_fails_original() {
        let multicast = Multicast::builder(vec![tag("a"), tag("b")])
            .strategy(|_: Option<Exchange>, _: Exchange| -> Result<Exchange, BoxError> {
                Err("cannot merge".into())
            })
            .build();
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::Aggregation(_))
        ));
        assert_eq!(multicast.in_flight(), 0);
    }

    #[test]
    fn test_empty_multicast_completes() {
        let multicast = Multicast::builder(Vec::new()).strategy(concat).build();
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert_eq!(ex.body().to_text(), "x");
    }

    #[test]
    fn test_parallel_without_executor_is_rejected() {
        let multicast = Multicast::builder(vec![tag("a")])
            .parallel_processing(true)
            .build();
        assert!(multicast.start().is_err());
        let ex = process_sync(&multicast, Exchange::new("x")).unwrap();
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::Rejected(_))
        ));
    }

    #[test]
    fn test_transacted_runs_on_calling_thread() {
        let caller = std::thread::current().id();
        let threads = Arc::new(Mutex::new(Vec::new()));
        let t = threads.clone();
        let check = processor(move |ex| {
            assert!(ex.is_transacted());
            t.lock().push(std::thread::current().id());
            Ok(())
        });
        let multicast = Multicast::builder(vec![check.clone(), check])
            .strategy(concat)
            .build();
        let ex = process_sync(&multicast, Exchange::new("x").transacted()).unwrap();
        assert!(ex.is_transacted());
        assert_eq!(*threads.lock(), vec![caller, caller]);
    }

    #[test]
    fn test_error_handler_wrappers_are_cached() {
        struct Passthrough;
        impl ErrorHandlerFactory for Passthrough {
            fn wrap(&self, processor: SharedProcessor) -> Result<SharedProcessor, BoxError> {
                Ok(processor)
            }
        }
        let multicast = Multicast::builder(vec![tag("a"), tag("b")])
            .error_handler(Arc::new(Passthrough))
            .build();
        process_sync(&multicast, Exchange::new("x")).unwrap();
        process_sync(&multicast, Exchange::new("y")).unwrap();
        assert_eq!(multicast.prepared_processors(), 2);
    }

    #[test]
    fn test_branch_exchanges_go_back_to_the_pool() {
        let multicast = Multicast::builder(vec![tag("a"), tag("b")]).build();
        for _ in 0..3 {
            process_sync(&multicast, Exchange::new("x")).unwrap();
        }
        let stats = multicast.exchange_statistics();
        assert_eq!(stats.in_flight(), 0);
        assert!(stats.created <= 2);
        assert!(multicast.exchange_pool_size() <= multicast.options().pool.capacity);
    }
}
