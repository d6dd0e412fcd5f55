//! Branch descriptors and the iterable that yields them.

use sluice_core::{BoxError, Exchange, SharedProcessor};
use std::{fmt, iter::Peekable};

/// Callouts around the processing of one branch.
pub trait PairHooks: Send + 'static {
    /// Called right before the branch processor runs.
    fn begin(&mut self) {}

    /// Called once the branch processor is done.
    fn done(&mut self, _exchange: &Exchange) {}
}

/// A processor together with the exchange copy it will process.
pub struct ProcessorExchangePair {
    index: usize,
    processor: SharedProcessor,
    prepared: SharedProcessor,
    exchange: Exchange,
    hooks: Option<Box<dyn PairHooks>>,
}

impl ProcessorExchangePair {
    /// Creates a pair. `prepared` is `processor` wrapped for branch use.
    pub fn new(
        index: usize,
        processor: SharedProcessor,
        prepared: SharedProcessor,
        exchange: Exchange,
    ) -> Self {
        Self {
            index,
            processor,
            prepared,
            exchange,
            hooks: None,
        }
    }

    /// Attaches begin/done callouts.
    pub fn with_hooks(mut self, hooks: impl PairHooks) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Position of this pair in creation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The unwrapped processor.
    pub fn processor(&self) -> &SharedProcessor {
        &self.processor
    }

    /// The processor actually invoked.
    pub fn prepared(&self) -> &SharedProcessor {
        &self.prepared
    }

    /// The branch exchange.
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Mutable access to the branch exchange.
    pub fn exchange_mut(&mut self) -> &mut Exchange {
        &mut self.exchange
    }

    pub(crate) fn into_parts(self) -> (Branch, Exchange) {
        (
            Branch {
                prepared: self.prepared,
                hooks: self.hooks,
            },
            self.exchange,
        )
    }
}

impl fmt::Debug for ProcessorExchangePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorExchangePair")
            .field("index", &self.index)
            .field("exchange", &self.exchange.exchange_id())
            .finish_non_exhaustive()
    }
}

/// A dispatched pair whose exchange is in flight.
pub(crate) struct Branch {
    pub(crate) prepared: SharedProcessor,
    hooks: Option<Box<dyn PairHooks>>,
}

impl Branch {
    pub(crate) fn begin(&mut self) {
        if let Some(hooks) = &mut self.hooks {
            hooks.begin();
        }
    }

    pub(crate) fn done(&mut self, exchange: &Exchange) {
        if let Some(hooks) = &mut self.hooks {
            hooks.done(exchange);
        }
    }
}

type PairIter = Box<dyn Iterator<Item = Result<ProcessorExchangePair, BoxError>> + Send>;

/// The single-pass sequence of pairs of one multicast.
///
/// The close hook runs exactly once: when the multicast finishes, or when
/// the sequence is dropped.
pub struct Pairs {
    iter: Peekable<PairIter>,
    size: Option<usize>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Pairs {
    /// Pairs known upfront.
    pub fn from_vec(pairs: Vec<ProcessorExchangePair>) -> Self {
        let size = Some(pairs.len());
        let iter: PairIter = Box::new(pairs.into_iter().map(Ok));
        Self {
            iter: iter.peekable(),
            size,
            on_close: None,
        }
    }

    /// Pairs created on demand. `size` is the total, when known.
    pub fn lazy<I>(iter: I, size: Option<usize>) -> Self
    where
        I: Iterator<Item = Result<ProcessorExchangePair, BoxError>> + Send + 'static,
    {
        let iter: PairIter = Box::new(iter);
        Self {
            iter: iter.peekable(),
            size,
            on_close: None,
        }
    }

    /// Sets the hook releasing resources held by the underlying iterator.
    pub fn with_close(mut self, on_close: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }

    /// Total number of pairs, when known upfront.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Returns true if another pair will be produced.
    pub fn has_next(&mut self) -> bool {
        self.iter.peek().is_some()
    }

    /// Runs the close hook if it has not run yet.
    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Iterator for Pairs {
    type Item = Result<ProcessorExchangePair, BoxError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl Drop for Pairs {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Pairs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairs")
            .field("size", &self.size)
            .field("closed", &self.on_close.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::processor;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn pair(index: usize) -> ProcessorExchangePair {
        let p = processor(|_| Ok(()));
        ProcessorExchangePair::new(index, p.clone(), p, Exchange::new(index))
    }

    #[test]
    fn test_close_runs_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let mut pairs = Pairs::from_vec(vec![pair(0), pair(1)]).with_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(pairs.size(), Some(2));
        assert!(pairs.next().is_some());
        assert!(pairs.has_next());
        pairs.close();
        drop(pairs);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_pairs_are_created_on_demand() {
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        let mut pairs = Pairs::lazy(
            (0..3).map(move |i| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(pair(i))
            }),
            None,
        );
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert!(pairs.next().is_some());
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pairs.count(), 2);
    }
}
