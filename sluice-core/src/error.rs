//! Error types for Sluice.
//!
//! This module provides the error vocabulary of the routing engine:
//!
//! - [`Failure`] - The failure state attached to an exchange
//! - [`RoutingError`] - Errors raised by the composition primitives
//! - [`RejectedExecution`] - A bounded resource refused more work
//! - [`LifecycleError`] - A service was driven through its lifecycle out of order
//!
//! Nothing in the engine throws across an asynchronous boundary. Once a
//! processor has suspended, failures only travel as [`Failure`] values
//! stored on the exchange.

use std::{error::Error, fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// A boxed error type for user-supplied code (processors, expressions, strategies).
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A shared, cloneable error.
pub type Cause = Arc<dyn Error + Send + Sync + 'static>;

/// Errors raised by the routing primitives themselves.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// A multicast branch failed while `stop_on_exception` was enabled.
    #[error("multicast processing failed for number {index}")]
    MulticastFailed {
        /// Dispatch index of the failed branch.
        index: usize,
        /// The branch failure.
        #[source]
        source: Cause,
    },

    /// The aggregation strategy returned an error.
    #[error("aggregation strategy failed")]
    Aggregation(#[source] Cause),

    /// A bounded executor refused new work.
    #[error(transparent)]
    Rejected(#[from] RejectedExecution),

    /// The throttler is configured to reject and the limit was reached.
    #[error("exceeded the max throttle rate of {max} concurrent requests")]
    ThrottlerRejected {
        /// The limit in force when the exchange was rejected.
        max: usize,
    },

    /// A rollback was requested.
    #[error("{}", .0.as_deref().unwrap_or("intended rollback"))]
    Rollback(Option<String>),

    /// An expression or predicate could not be evaluated.
    #[error("expression failed: {0}")]
    Expression(String),

    /// Reading or copying a stream body failed.
    #[error("stream body error: {0}")]
    Stream(String),

    /// No endpoint could be resolved for the given uri.
    #[error("no endpoint could be resolved for uri: {0}")]
    NoSuchEndpoint(String),

    /// A processor was invoked before it was started.
    #[error("{0} is not started")]
    NotStarted(&'static str),

    /// A lifecycle transition was requested out of order.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Returned when a bounded resource cannot admit more work.
#[derive(Error, Debug, Clone)]
#[error("task rejected by {executor}: {reason}")]
pub struct RejectedExecution {
    /// Name of the rejecting executor.
    pub executor: String,
    /// Why the task was rejected.
    pub reason: String,
}

impl RejectedExecution {
    /// Creates a new rejection for the named executor.
    pub fn new(executor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            reason: reason.into(),
        }
    }
}

/// Errors produced by the service lifecycle guard.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot {action} a service in state {state}")]
    InvalidTransition {
        /// The requested action.
        action: &'static str,
        /// The state the service was in.
        state: &'static str,
    },
}

/// Raised when a multicast gives up waiting for its branches.
///
/// Timeouts are surfaced to aggregation strategies through their explicit
/// timeout hook; this type exists so strategies that want to record the
/// timeout as a failure have something to attach.
#[derive(Error, Debug, Clone, Copy)]
#[error("multicast timed out after {0:?}")]
pub struct TimeoutElapsed(pub Duration);

/// The failure state of an exchange.
///
/// A `Failure` is cheap to clone and keeps every error it has absorbed:
/// the primary cause and any suppressed causes (for example the original
/// failure that was still pending when a finally block failed again).
#[derive(Clone)]
pub struct Failure {
    cause: Cause,
    suppressed: Vec<Cause>,
}

impl Failure {
    /// Wraps a concrete error.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::from_cause(Arc::new(error))
    }

    /// Wraps an already shared error.
    pub fn from_cause(cause: Cause) -> Self {
        Self {
            cause,
            suppressed: Vec::new(),
        }
    }

    /// Wraps a boxed error returned by user code.
    pub fn from_boxed(error: BoxError) -> Self {
        Self::from_cause(Arc::from(error))
    }

    /// Wraps a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::from_boxed(message.into())
    }

    /// The primary cause.
    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    /// Causes suppressed by this failure.
    pub fn suppressed(&self) -> &[Cause] {
        &self.suppressed
    }

    /// Records another failure as suppressed by this one.
    pub fn add_suppressed(&mut self, other: Failure) {
        self.suppressed.push(other.cause);
        self.suppressed.extend(other.suppressed);
    }

    /// Iterates the cause chain, outermost first.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(peel(self.cause.as_ref())),
        }
    }

    /// Returns the first error in the chain of type `T`.
    pub fn find<T: Error + 'static>(&self) -> Option<&T> {
        self.chain().find_map(|e| e.downcast_ref::<T>())
    }

    /// Returns true if any error in the chain is of type `T`.
    pub fn is<T: Error + 'static>(&self) -> bool {
        self.find::<T>().is_some()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("cause", &self.cause)
            .field("suppressed", &self.suppressed.len())
            .finish()
    }
}

impl<E> From<E> for Failure
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Failure::new(error)
    }
}

/// Iterator over an error's cause chain.
pub struct Chain<'a> {
    next: Option<&'a (dyn Error + 'static)>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a (dyn Error + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.source().map(peel);
        Some(current)
    }
}

// `Arc<E>` forwards `source()` to `E`, which would hide `E` itself from the
// chain. Unwrap shared layers so every link is a concrete error.
fn peel<'a>(mut error: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    while let Some(shared) = error.downcast_ref::<Cause>() {
        error = shared.as_ref();
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("io broke")]
    struct IoFault;

    #[derive(Debug, Error)]
    #[error("wrapper")]
    struct Wrapper(#[source] IoFault);

    #[test]
    fn test_chain_walks_shared_causes() {
        let inner = Failure::new(IoFault);
        let outer = Failure::new(RoutingError::MulticastFailed {
            index: 2,
            source: inner.cause().clone(),
        });

        let links: Vec<String> = outer.chain().map(|e| e.to_string()).collect();
        assert_eq!(links, vec!["multicast processing failed for number 2", "io broke"]);
        assert!(outer.is::<IoFault>());
    }

    #[test]
    fn test_find_nested_source() {
        let failure = Failure::new(Wrapper(IoFault));
        assert!(failure.find::<IoFault>().is_some());
        assert!(failure.find::<RoutingError>().is_none());
    }

    #[test]
    fn test_suppressed_are_accumulated() {
        let mut first = Failure::msg("first");
        let mut second = Failure::msg("second");
        second.add_suppressed(Failure::msg("third"));
        first.add_suppressed(second);
        assert_eq!(first.suppressed().len(), 2);
        assert_eq!(first.to_string(), "first");
    }

    #[test]
    fn test_rollback_message() {
        assert_eq!(RoutingError::Rollback(None).to_string(), "intended rollback");
        assert_eq!(
            RoutingError::Rollback(Some("bad order".into())).to_string(),
            "bad order"
        );
    }
}
