//! Try blocks: a body followed by catch clauses and an optional finally.
//!
//! Steps run in order like a pipeline, except that a failure does not
//! break out: the catch clauses are there to see it. Only a route stop
//! ends the block early.

use crate::{catch::Catch, finally::Finally};
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Service, ServiceState, SharedProcessor,
    reactive,
};
use std::sync::Arc;

/// A try body with its catch and finally clauses.
pub struct TryBlock {
    steps: Arc<[SharedProcessor]>,
    catches: usize,
    has_finally: bool,
    state: ServiceState,
}

/// Builds a [`TryBlock`].
pub struct TryBlockBuilder {
    body: SharedProcessor,
    catches: Vec<SharedProcessor>,
    finally: Option<SharedProcessor>,
}

impl TryBlockBuilder {
    /// Adds a catch clause. Clauses are tried in the order they are added.
    pub fn catch(mut self, clause: Catch) -> Self {
        self.catches.push(Arc::new(clause));
        self
    }

    /// Sets the finally clause body.
    pub fn finally(mut self, processor: SharedProcessor) -> Self {
        self.finally = Some(Arc::new(Finally::new(processor)));
        self
    }

    /// Builds the block.
    pub fn build(self) -> TryBlock {
        let catches = self.catches.len();
        let has_finally = self.finally.is_some();
        let mut steps = Vec::with_capacity(catches + 2);
        steps.push(self.body);
        steps.extend(self.catches);
        steps.extend(self.finally);
        TryBlock {
            steps: steps.into(),
            catches,
            has_finally,
            state: ServiceState::new(),
        }
    }
}

impl TryBlock {
    /// Starts a block around `body`.
    pub fn builder(body: SharedProcessor) -> TryBlockBuilder {
        TryBlockBuilder {
            body,
            catches: Vec::new(),
            finally: None,
        }
    }

    /// Number of catch clauses.
    pub fn catch_count(&self) -> usize {
        self.catches
    }

    /// Returns true if the block has a finally clause.
    pub fn has_finally(&self) -> bool {
        self.has_finally
    }
}

struct TryState {
    steps: Arc<[SharedProcessor]>,
    index: usize,
    handled_before: bool,
    callback: AsyncCallback,
}

fn run(mut state: TryState, mut exchange: Exchange) {
    let more = state.index < state.steps.len();
    if more && !exchange.is_route_stop() {
        if state.index > 0 {
            exchange.prepare_out_to_in();
        }
        let step = Arc::clone(&state.steps[state.index]);
        state.index += 1;
        step.process(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                reactive::schedule(move || run(state, exchange));
            }),
        );
        return;
    }
    exchange.prepare_out_to_in();
    let properties = exchange.properties_mut();
    properties.failure_handled = state.handled_before || properties.failure_handled;
    tracing::trace!(
        exchange_id = exchange.exchange_id(),
        steps = state.index,
        "try block done"
    );
    let callback = state.callback;
    reactive::schedule(move || callback.done(exchange, false));
}

impl Service for TryBlock {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.state)
    }

    fn do_build(&self) -> Result<(), BoxError> {
        self.steps.iter().try_for_each(|p| p.build())
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.steps.iter().try_for_each(|p| p.init())
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.steps.iter().try_for_each(|p| p.start())
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.steps.iter().rev().try_for_each(|p| p.stop())
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.steps.iter().rev().try_for_each(|p| p.shutdown())
    }
}

impl AsyncProcessor for TryBlock {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let handled_before = std::mem::take(&mut exchange.properties_mut().failure_handled);
        let state = TryState {
            steps: Arc::clone(&self.steps),
            index: 0,
            handled_before,
            callback,
        };
        if exchange.is_transacted() {
            reactive::schedule_sync(move || run(state, exchange));
        } else {
            reactive::schedule_main(move || run(state, exchange));
        }
        false
    }
}
