//! Completed branches waiting to be aggregated.

use sluice_core::Exchange;
use std::collections::{BTreeMap, VecDeque};

/// Holds completed branch exchanges until they are aggregated.
///
/// In ordered mode a branch is only handed out once every branch with a
/// lower dispatch index has been handed out. In streaming mode branches are
/// handed out in completion order.
#[derive(Debug)]
pub enum CompletionQueue {
    /// Dispatch-index order.
    Ordered {
        /// Completed branches keyed by index.
        ready: BTreeMap<usize, Exchange>,
        /// The next index to hand out.
        next: usize,
    },
    /// Completion order.
    Streaming(VecDeque<(usize, Exchange)>),
}

impl CompletionQueue {
    /// A queue releasing branches in dispatch order.
    pub fn ordered() -> Self {
        CompletionQueue::Ordered {
            ready: BTreeMap::new(),
            next: 0,
        }
    }

    /// A queue releasing branches as they complete.
    pub fn streaming() -> Self {
        CompletionQueue::Streaming(VecDeque::new())
    }

    /// Adds a completed branch.
    pub fn push(&mut self, index: usize, exchange: Exchange) {
        match self {
            CompletionQueue::Ordered { ready, .. } => {
                ready.insert(index, exchange);
            }
            CompletionQueue::Streaming(queue) => queue.push_back((index, exchange)),
        }
    }

    /// Takes the next branch that may be aggregated.
    pub fn poll(&mut self) -> Option<(usize, Exchange)> {
        match self {
            CompletionQueue::Ordered { ready, next } => {
                let exchange = ready.remove(next)?;
                let index = *next;
                *next += 1;
                Some((index, exchange))
            }
            CompletionQueue::Streaming(queue) => queue.pop_front(),
        }
    }

    /// Takes any completed branch, lowest index first when ordered.
    ///
    /// Used once waiting has been given up, when gaps no longer matter.
    pub fn poll_unordered(&mut self) -> Option<(usize, Exchange)> {
        match self {
            CompletionQueue::Ordered { ready, next } => {
                let (index, exchange) = ready.pop_first()?;
                *next = index + 1;
                Some((index, exchange))
            }
            CompletionQueue::Streaming(queue) => queue.pop_front(),
        }
    }

    /// Returns true if [`poll`](CompletionQueue::poll) would return a branch.
    pub fn has_ready(&self) -> bool {
        match self {
            CompletionQueue::Ordered { ready, next } => ready.contains_key(next),
            CompletionQueue::Streaming(queue) => !queue.is_empty(),
        }
    }

    /// Removes every held branch.
    pub fn drain(&mut self) -> Vec<Exchange> {
        match self {
            CompletionQueue::Ordered { ready, .. } => {
                std::mem::take(ready).into_values().collect()
            }
            CompletionQueue::Streaming(queue) => queue.drain(..).map(|(_, ex)| ex).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_waits_for_gaps() {
        let mut queue = CompletionQueue::ordered();
        queue.push(1, Exchange::new("b"));
        assert!(!queue.has_ready());
        assert!(queue.poll().is_none());
        queue.push(0, Exchange::new("a"));
        assert_eq!(queue.poll().map(|(i, _)| i), Some(0));
        assert_eq!(queue.poll().map(|(i, _)| i), Some(1));
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_streaming_is_completion_order() {
        let mut queue = CompletionQueue::streaming();
        queue.push(2, Exchange::new("c"));
        queue.push(0, Exchange::new("a"));
        assert_eq!(queue.poll().map(|(i, _)| i), Some(2));
        assert_eq!(queue.poll().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn test_poll_unordered_skips_gaps() {
        let mut queue = CompletionQueue::ordered();
        queue.push(2, Exchange::new("c"));
        assert_eq!(queue.poll_unordered().map(|(i, _)| i), Some(2));
        assert!(queue.drain().is_empty());
    }
}
