//! Decorator stages wrapped around processors.
//!
//! Instead of nesting delegate processors, a processor is wrapped once in
//! an [`InternalProcessor`] holding an ordered list of [`Advice`] stages.
//! Every stage's `before` runs in order before the processor; their `after`
//! runs in reverse order once the processor is done, on whichever thread
//! completed it.

use crate::await_manager::{CallbackDropped, process_sync};
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Failure, Service, SharedProcessor,
    UnitOfWork,
};
use std::{any::Any, sync::Arc, time::Instant};

/// Per-exchange state an advice carries from `before` to `after`.
pub type AdviceState = Option<Box<dyn Any + Send>>;

/// A stage run around a processor.
pub trait Advice: Send + Sync + 'static {
    /// Runs before the processor. An error fails the exchange and skips it.
    fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, BoxError>;

    /// Runs after the processor with the state returned by `before`.
    fn after(&self, exchange: &mut Exchange, state: AdviceState);
}

/// A processor wrapped in an ordered list of advices.
pub struct InternalProcessor {
    processor: SharedProcessor,
    advices: Arc<[Arc<dyn Advice>]>,
}

impl InternalProcessor {
    /// Wraps `processor` with `advices`, outermost first.
    pub fn new(processor: SharedProcessor, advices: Vec<Arc<dyn Advice>>) -> Self {
        Self {
            processor,
            advices: advices.into(),
        }
    }

    /// The wrapped processor.
    pub fn processor(&self) -> &SharedProcessor {
        &self.processor
    }
}

fn run_after(advices: &[Arc<dyn Advice>], states: Vec<AdviceState>, exchange: &mut Exchange) {
    for (advice, state) in advices.iter().zip(states).rev() {
        advice.after(exchange, state);
    }
}

impl Service for InternalProcessor {
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

impl AsyncProcessor for InternalProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let mut states = Vec::with_capacity(self.advices.len());
        for advice in self.advices.iter() {
            match advice.before(&mut exchange) {
                Ok(state) => states.push(state),
                Err(error) => {
                    exchange.set_exception(Failure::from_boxed(error));
                    run_after(&self.advices, states, &mut exchange);
                    callback.done(exchange, true);
                    return true;
                }
            }
        }
        let advices = Arc::clone(&self.advices);
        self.processor.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                run_after(&advices, states, &mut exchange);
                callback.done(exchange, done_sync);
            }),
        )
    }

    fn id(&self) -> Option<&str> {
        self.processor.id()
    }
}

/// Starts a unit of work when the exchange has none and completes it once
/// the processor is done. With a route id, also fires the route hooks.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWorkAdvice {
    route_id: Option<String>,
}

impl UnitOfWorkAdvice {
    /// An advice for processors outside any route.
    pub fn new() -> Self {
        Self::default()
    }

    /// An advice entering and leaving `route_id`.
    pub fn for_route(route_id: impl Into<String>) -> Self {
        Self {
            route_id: Some(route_id.into()),
        }
    }
}

struct UnitOfWorkState {
    created: bool,
    previous_route: Option<String>,
}

impl Advice for UnitOfWorkAdvice {
    fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, BoxError> {
        let (uow, created) = match exchange.unit_of_work() {
            Some(uow) => (Arc::clone(uow), false),
            None => (UnitOfWork::start(exchange), true),
        };
        let previous_route = exchange.route_id().map(str::to_owned);
        if let Some(route_id) = &self.route_id {
            exchange.set_route_id(Some(route_id.clone()));
            uow.before_route(route_id, exchange);
        }
        Ok(Some(Box::new(UnitOfWorkState {
            created,
            previous_route,
        })))
    }

    fn after(&self, exchange: &mut Exchange, state: AdviceState) {
        let Some(state) = state.and_then(|s| s.downcast::<UnitOfWorkState>().ok()) else {
            return;
        };
        let Some(uow) = exchange.unit_of_work().cloned() else {
            return;
        };
        if let Some(route_id) = &self.route_id {
            uow.after_route(route_id, exchange);
            exchange.set_route_id(state.previous_route);
        }
        if state.created {
            uow.done(exchange);
            exchange.take_unit_of_work();
        }
    }
}

/// Logs each exchange entering and leaving the wrapped processor.
#[derive(Debug, Clone)]
pub struct TracingAdvice {
    name: String,
}

impl TracingAdvice {
    /// An advice logging under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Advice for TracingAdvice {
    fn before(&self, exchange: &mut Exchange) -> Result<AdviceState, BoxError> {
        tracing::debug!(
            processor = %self.name,
            exchange_id = exchange.exchange_id(),
            "exchange started"
        );
        Ok(Some(Box::new(Instant::now())))
    }

    fn after(&self, exchange: &mut Exchange, state: AdviceState) {
        let elapsed = state
            .and_then(|s| s.downcast::<Instant>().ok())
            .map(|started| started.elapsed());
        tracing::debug!(
            processor = %self.name,
            exchange_id = exchange.exchange_id(),
            failed = exchange.is_failed(),
            ?elapsed,
            "exchange done"
        );
    }
}

/// A processor tree consuming exchanges under a route id.
///
/// Every exchange gets a unit of work for the duration of the route, and
/// route level tracing.
pub struct Route {
    id: String,
    processor: InternalProcessor,
}

impl Route {
    /// Wraps `processor` as the route `id`.
    pub fn new(id: impl Into<String>, processor: SharedProcessor) -> Self {
        let id = id.into();
        let advices: Vec<Arc<dyn Advice>> = vec![
            Arc::new(UnitOfWorkAdvice::for_route(id.clone())),
            Arc::new(TracingAdvice::new(id.clone())),
        ];
        Self {
            processor: InternalProcessor::new(processor, advices),
            id,
        }
    }

    /// The route id.
    pub fn route_id(&self) -> &str {
        &self.id
    }

    /// Sends `exchange` through the route and waits for the result.
    pub fn send(&self, exchange: Exchange) -> Result<Exchange, CallbackDropped> {
        process_sync(self, exchange)
    }
}

impl Service for Route {
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

impl AsyncProcessor for Route {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.processor.process(exchange, callback)
    }

    fn id(&self) -> Option<&str> {
        Some(&self.id)
    }
}
