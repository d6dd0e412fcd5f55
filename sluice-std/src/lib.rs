//! # sluice-std
//!
//! Standard processors for the Sluice asynchronous message-routing engine.
//!
//! This crate provides:
//! - **Sequencing**: [`Pipeline`](pipeline::Pipeline), [`Loop`](looping::Loop)
//! - **Fan-out**: [`Multicast`](multicast::Multicast), [`Splitter`](splitter::Splitter),
//!   [`RecipientList`](recipient_list::RecipientList), standard aggregation strategies
//! - **Routing**: [`Choice`](choice::Choice), [`Filter`](choice::Filter)
//! - **Flow control**: [`Throttler`](throttler::Throttler)
//! - **Error handling**: [`TryBlock`](try_block::TryBlock), [`Catch`](catch::Catch),
//!   [`Finally`](finally::Finally), [`Rollback`](rollback::Rollback),
//!   [`OnCompletion`](on_completion::OnCompletion)
//! - **Runtime**: pooled task and exchange factories, the await manager, a
//!   tokio backed executor service, the producer cache and route advices

#![deny(clippy::wildcard_imports)]
#![warn(missing_docs)]

// Re-export core contracts
pub use sluice_core;

// Modules
pub mod aggregate;
pub mod await_manager;
pub mod catch;
pub mod choice;
pub mod exchange_factory;
pub mod executor;
pub mod finally;
pub mod helper;
pub mod internal;
pub mod looping;
pub mod multicast;
pub mod on_completion;
pub mod pipeline;
pub mod pool;
pub mod producer_cache;
pub mod recipient_list;
pub mod rollback;
pub mod splitter;
pub mod testing;
pub mod throttler;
pub mod try_block;
