//! Sequential chaining of processors.
//!
//! A pipeline hands the exchange from one step to the next. Each step is
//! resumed from the reactive executor rather than from the previous step's
//! callback, so arbitrarily long pipelines run in constant stack depth.

use crate::{
    helper::continue_processing,
    pool::{PoolOptions, PoolSnapshot, Pooled, PooledTask, TaskPool},
};
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Service, ServiceState, SharedProcessor,
    reactive,
};
use std::sync::Arc;

/// Per-exchange pipeline state.
#[derive(Default)]
pub struct PipelineTask {
    exchange: Option<Exchange>,
    callback: Option<AsyncCallback>,
    index: usize,
    processors: Option<Arc<[SharedProcessor]>>,
}

impl PipelineTask {
    /// Index of the next step to run.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns true when no exchange or callback is held.
    pub fn is_clear(&self) -> bool {
        self.exchange.is_none() && self.callback.is_none() && self.processors.is_none()
    }
}

impl PooledTask for PipelineTask {
    fn reset(&mut self) {
        self.exchange = None;
        self.callback = None;
        self.index = 0;
        self.processors = None;
    }
}

/// Runs processors one after another on the same exchange.
pub struct Pipeline {
    processors: Arc<[SharedProcessor]>,
    pool: Arc<TaskPool<PipelineTask>>,
    id: Option<String>,
    state: ServiceState,
}

impl Pipeline {
    /// Creates a pipeline over `processors`.
    pub fn new(processors: Vec<SharedProcessor>) -> Self {
        Self::with_pool(processors, PoolOptions::default())
    }

    /// Creates a pipeline with explicit task pool sizing.
    pub fn with_pool(processors: Vec<SharedProcessor>, options: PoolOptions) -> Self {
        Self {
            processors: processors.into(),
            pool: TaskPool::new(options),
            id: None,
            state: ServiceState::new(),
        }
    }

    /// Sets the identifier used in logs.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The steps of this pipeline.
    pub fn processors(&self) -> &[SharedProcessor] {
        &self.processors
    }

    /// Counters of the task pool.
    pub fn task_pool_statistics(&self) -> PoolSnapshot {
        self.pool.statistics()
    }

    /// Number of idle pooled tasks.
    pub fn task_pool_size(&self) -> usize {
        self.pool.size()
    }
}

fn run(mut task: Pooled<PipelineTask>) {
    let Some(mut exchange) = task.exchange.take() else {
        return;
    };
    let Some(processors) = task.processors.clone() else {
        return;
    };
    let first = task.index == 0;
    let more = task.index < processors.len();

    if !exchange.is_route_stop()
        && more
        && (first || continue_processing(&exchange, "so breaking out of pipeline"))
    {
        if !first {
            exchange.prepare_out_to_in();
        }
        let processor = Arc::clone(&processors[task.index]);
        task.index += 1;
        tracing::trace!(
            exchange_id = exchange.exchange_id(),
            step = task.index,
            "processing exchange in pipeline"
        );
        processor.process(
            exchange,
            AsyncCallback::new(move |exchange, _| {
                task.exchange = Some(exchange);
                reactive::schedule(move || run(task));
            }),
        );
    } else {
        exchange.prepare_out_to_in();
        tracing::trace!(
            exchange_id = exchange.exchange_id(),
            steps = task.index,
            "pipeline done"
        );
        let callback = task.callback.take();
        drop(task);
        if let Some(callback) = callback {
            reactive::schedule(move || callback.done(exchange, false));
        }
    }
}

impl Service for Pipeline {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.state)
    }

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

impl AsyncProcessor for Pipeline {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let transacted = exchange.is_transacted();
        let mut task = self.pool.acquire(PipelineTask::default);
        task.exchange = Some(exchange);
        task.callback = Some(callback);
        task.processors = Some(Arc::clone(&self.processors));
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
