//! # sluice-core
//!
//! Core contracts for the Sluice asynchronous message-routing engine.
//!
//! This crate has minimal dependencies and is designed to be imported by
//! components that provide processors, strategies or executors without
//! depending on the full `sluice-std` implementation.
//!
//! # Building Blocks
//!
//! ## The exchange ([`Exchange`])
//!
//! The envelope carrying one message through a route: input and output
//! [`Message`]s, a [`Failure`], typed [`ExchangeProperties`] and routing
//! [`ExchangeFlags`]. Exchanges are moved by value, so a single owner
//! exists at any instant.
//!
//! ## The continuation contract ([`AsyncProcessor`])
//!
//! A processor receives the exchange together with an [`AsyncCallback`]
//! and reports whether it finished on the calling stack. Synchronous work
//! implements [`Processor`] and is adapted with [`processor`].
//!
//! ## Scheduling ([`reactive`], [`ExecutorService`])
//!
//! The reactive executor runs continuations cooperatively on the current
//! thread. An [`ExecutorService`] supplies real parallelism when a
//! component asks for it.
//!
//! ## Completion ([`UnitOfWork`], [`Synchronization`])
//!
//! Hooks that fire exactly once when an exchange's processing is done.
//!
//! # Error Types
//!
//! - [`Failure`] - Failure state attached to an exchange
//! - [`RoutingError`] - Errors raised by the routing primitives
//! - [`RejectedExecution`] - A bounded resource refused more work
//! - [`LifecycleError`] - Lifecycle transitions out of order

#![deny(clippy::wildcard_imports)]
#![warn(missing_docs)]

mod aggregation;
mod endpoint;
mod error;
mod exchange;
mod executor;
mod expression;
mod message;
mod processor;
pub mod reactive;
mod service;
mod unit_of_work;
mod value;

// Re-exports
pub use aggregation::{AggregationStrategy, SharedAggregationStrategy};
pub use endpoint::{Endpoint, EndpointResolver, ErrorHandlerFactory};
pub use error::{
    BoxError, Cause, Chain, Failure, LifecycleError, RejectedExecution, RoutingError,
    TimeoutElapsed,
};
pub use exchange::{Exchange, ExchangeFlags, ExchangeLease, ExchangeProperties, ThrottleEnqueue};
pub use executor::{ExecutorService, ScheduledHandle, SharedExecutor};
pub use expression::{
    Expression, Predicate, SharedExpression, SharedPredicate, body, constant, expression, header,
    header_equals, predicate, try_expression, try_predicate,
};
pub use message::Message;
pub use processor::{
    AsyncCallback, AsyncProcessor, Processor, SharedProcessor, SyncAdapter, processor,
    processor_key, shared,
};
pub use reactive::Task;
pub use service::{Service, ServiceState, ServiceStatus, ShutdownAware};
pub use unit_of_work::{Synchronization, UnitOfWork};
pub use value::{StreamCache, Value};
