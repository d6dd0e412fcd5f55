//! # sluice - Asynchronous Message Routing
//!
//! `sluice` composes processors into routes that move an exchange through
//! sequential, parallel, conditional and iterative topologies. Every
//! processor works in continuation style: it takes the exchange by value,
//! hands it back through an [`AsyncCallback`] and reports whether that
//! happened on the caller's stack.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let route = Route::new(
//!     "orders",
//!     shared(Pipeline::new(vec![
//!         processor(|ex| {
//!             ex.set_body(format!("<{}>", ex.body()));
//!             Ok(())
//!         }),
//!         shared(Multicast::builder(vec![audit, billing]).parallel_processing(true).build()),
//!     ])),
//! );
//!
//! route.start()?;
//! let done = route.send(Exchange::new("order-1"))?;
//! ```

#![deny(clippy::wildcard_imports)]
#![warn(missing_docs)]

pub use sluice_core::{
    // Aggregation
    AggregationStrategy,
    // Processors
    AsyncCallback,
    AsyncProcessor,
    // Errors
    BoxError,
    Cause,
    // Endpoints
    Endpoint,
    EndpointResolver,
    ErrorHandlerFactory,
    // Exchange
    Exchange,
    // Executors
    ExecutorService,
    ExchangeFlags,
    ExchangeProperties,
    // Expressions
    Expression,
    Failure,
    LifecycleError,
    Message,
    Predicate,
    Processor,
    RejectedExecution,
    RoutingError,
    ScheduledHandle,
    // Lifecycle
    Service,
    ServiceState,
    ServiceStatus,
    SharedAggregationStrategy,
    SharedExecutor,
    SharedExpression,
    SharedPredicate,
    SharedProcessor,
    ShutdownAware,
    StreamCache,
    // Completion
    Synchronization,
    ThrottleEnqueue,
    TimeoutElapsed,
    UnitOfWork,
    Value,
    body,
    constant,
    expression,
    header,
    header_equals,
    predicate,
    processor,
    reactive,
    shared,
    try_expression,
    try_predicate,
};

// Composition
pub use sluice_std::{
    catch::{Catch, ErrorMatcher},
    choice::{Choice, Filter},
    finally::Finally,
    looping::{Loop, LoopMode, LoopOptions},
    multicast::{Multicast, MulticastBuilder, MulticastOptions},
    on_completion::{OnCompletion, OnCompletionOptions},
    pipeline::Pipeline,
    recipient_list::{RecipientList, Recipients},
    rollback::Rollback,
    splitter::{Splitter, tokenize},
    throttler::{Throttler, ThrottlerOptions},
    try_block::TryBlock,
};

// Runtime
pub use sluice_std::{
    await_manager::{CallbackDropped, process_sync},
    executor::{TokioExecutor, TokioExecutorOptions},
    internal::Route,
    pool::PoolOptions,
};

/// Standard aggregation strategies.
pub mod aggregate {
    pub use sluice_std::aggregate::{BodyConcat, GroupedBody, UseLatest, UseOriginal};
}

/// Fan-out internals for custom branch sources.
pub mod multicast {
    pub use sluice_std::multicast::{
        BranchContext, BranchSource, CompletionQueue, MulticastProcessor, PairHooks, Pairs,
        ProcessorExchangePair, StaticBranches,
    };
    pub use sluice_std::recipient_list::Recipients;
    pub use sluice_std::splitter::{ExpressionSplit, SplitBranches, SplitExpression, SplitItems};
}

/// Testing utilities.
pub mod testing {
    #![allow(clippy::wildcard_imports)]
    pub use sluice_std::testing::*;
}

/// Prelude module - common imports for Sluice.
///
/// # Usage
///
/// ```rust,ignore
/// use sluice::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Core contracts
        AggregationStrategy,
        AsyncCallback,
        AsyncProcessor,
        BoxError,
        // Composition
        Catch,
        Choice,
        ErrorMatcher,
        Exchange,
        Failure,
        Finally,
        Loop,
        Message,
        Multicast,
        OnCompletion,
        Pipeline,
        Processor,
        RecipientList,
        Rollback,
        // Runtime
        Route,
        RoutingError,
        Service,
        SharedProcessor,
        Splitter,
        Throttler,
        TryBlock,
        Value,
        // Helpers
        constant,
        header,
        header_equals,
        predicate,
        process_sync,
        processor,
        shared,
        tokenize,
    };
}
