//! Aggregation strategies used by the multicast family.

use crate::{error::BoxError, exchange::Exchange};
use std::{sync::Arc, time::Duration};

/// Folds branch exchanges into a single result.
///
/// [`aggregate`](AggregationStrategy::aggregate) is called once per branch
/// with the current result (`None` on the first call), the branch exchange,
/// and the original input exchange. Unless the owning multicast enables
/// parallel aggregation, calls are serialized.
pub trait AggregationStrategy: Send + Sync + 'static {
    /// Combines the current result with a completed branch.
    fn aggregate(
        &self,
        old: Option<Exchange>,
        new: Exchange,
        input: &Exchange,
    ) -> Result<Exchange, BoxError>;

    /// Called for a branch that did not complete before the timeout.
    ///
    /// Returns the (possibly replaced) current result.
    fn timeout(
        &self,
        current: Option<Exchange>,
        _index: usize,
        _total: usize,
        _timeout: Duration,
    ) -> Option<Exchange> {
        current
    }

    /// Called once the multicast finishes, before the result is copied back.
    fn on_completion(&self, _result: Option<&Exchange>, _original: &Exchange) {}
}

/// A shared aggregation strategy.
pub type SharedAggregationStrategy = Arc<dyn AggregationStrategy>;

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange, BoxError> + Send + Sync + 'static,
{
    fn aggregate(
        &self,
        old: Option<Exchange>,
        new: Exchange,
        _input: &Exchange,
    ) -> Result<Exchange, BoxError> {
        self(old, new)
    }
}
