//! Content based routing.

use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Failure, RoutingError, Service,
    ServiceState, SharedPredicate, SharedProcessor,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A processor guarded by a predicate.
///
/// Used on its own, a filter passes non-matching exchanges through
/// untouched.
pub struct Filter {
    predicate: SharedPredicate,
    processor: SharedProcessor,
    matched: AtomicUsize,
}

impl Filter {
    /// Routes exchanges matching `predicate` to `processor`.
    pub fn new(predicate: SharedPredicate, processor: SharedProcessor) -> Self {
        Self {
            predicate,
            processor,
            matched: AtomicUsize::new(0),
        }
    }

    /// Evaluates the predicate, counting matches.
    pub fn matches(&self, exchange: &Exchange) -> Result<bool, BoxError> {
        let matched = self.predicate.matches(exchange)?;
        if matched {
            self.matched.fetch_add(1, Ordering::Relaxed);
        }
        Ok(matched)
    }

    /// The guarded processor.
    pub fn processor(&self) -> &SharedProcessor {
        &self.processor
    }

    /// Number of exchanges that matched.
    pub fn matched_count(&self) -> usize {
        self.matched.load(Ordering::Relaxed)
    }
}

fn expression_failure(error: BoxError) -> Failure {
    Failure::new(RoutingError::Expression(error.to_string()))
}

impl Service for Filter {
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

impl AsyncProcessor for Filter {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        match self.matches(&exchange) {
            Ok(matched) => {
                exchange.properties_mut().filter_matched = Some(matched);
                if matched {
                    return self.processor.process(exchange, callback);
                }
            }
            Err(error) => exchange.set_exception(expression_failure(error)),
        }
        callback.done(exchange, true);
        true
    }
}

/// Routes to the first filter whose predicate matches, else to the
/// otherwise processor, else passes the exchange through.
pub struct Choice {
    filters: Vec<Filter>,
    otherwise: Option<SharedProcessor>,
    state: ServiceState,
}

impl Choice {
    /// A choice over `filters`, evaluated in order.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            otherwise: None,
            state: ServiceState::new(),
        }
    }

    /// Adds a `when` clause.
    pub fn when(mut self, predicate: SharedPredicate, processor: SharedProcessor) -> Self {
        self.filters.push(Filter::new(predicate, processor));
        self
    }

    /// Sets the processor used when no filter matches.
    pub fn otherwise(mut self, processor: SharedProcessor) -> Self {
        self.otherwise = Some(processor);
        self
    }

    /// The `when` clauses.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    fn select(&self, exchange: &mut Exchange) -> Result<Option<SharedProcessor>, BoxError> {
        for filter in &self.filters {
            let matched = filter.matches(exchange)?;
            exchange.properties_mut().filter_matched = Some(matched);
            if matched {
                return Ok(Some(filter.processor().clone()));
            }
        }
        Ok(self.otherwise.clone())
    }
}

impl Service for Choice {
    fn service_state(&self) -> Option<&ServiceState> {
        Some(&self.state)
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.filters.iter().try_for_each(|f| f.start())?;
        self.otherwise.iter().try_for_each(|p| p.start())
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.otherwise.iter().try_for_each(|p| p.stop())?;
        self.filters.iter().rev().try_for_each(|f| f.stop())
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.otherwise.iter().try_for_each(|p| p.shutdown())?;
        self.filters.iter().rev().try_for_each(|f| f.shutdown())
    }
}

impl AsyncProcessor for Choice {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if !self.state.is_started() {
            exchange.set_exception(RoutingError::NotStarted("choice"));
            callback.done(exchange, true);
            return true;
        }
        let saved = exchange.properties().filter_matched;
        let processor = match self.select(&mut exchange) {
            Ok(Some(processor)) => processor,
            Ok(None) => {
                exchange.properties_mut().filter_matched = saved;
                callback.done(exchange, true);
                return true;
            }
            Err(error) => {
                exchange.properties_mut().filter_matched = saved;
                exchange.set_exception(expression_failure(error));
                callback.done(exchange, true);
                return true;
            }
        };
        processor.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                exchange.properties_mut().filter_matched = saved;
                callback.done(exchange, done_sync);
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{await_manager::process_sync, testing::RecordingProcessor};
    use sluice_core::{header_equals, processor, try_predicate};

    fn choice(gold: &RecordingProcessor, any: &RecordingProcessor, other: &RecordingProcessor) -> Choice {
        Choice::new(Vec::new())
            .when(header_equals("kind", "gold"), gold.shared())
            .when(try_predicate(|_| Ok(true)), any.shared())
            .otherwise(other.shared())
    }

    #[test]
    fn test_first_match_wins() {
        let (gold, any, other) = (
            RecordingProcessor::new(),
            RecordingProcessor::new(),
            RecordingProcessor::new(),
        );
        let choice = choice(&gold, &any, &other);
        choice.start().unwrap();
        process_sync(&choice, Exchange::new("g").with_header("kind", "gold")).unwrap();
        process_sync(&choice, Exchange::new("s").with_header("kind", "silver")).unwrap();
        assert_eq!(gold.count(), 1);
        assert_eq!(any.count(), 1);
        assert_eq!(other.count(), 0);
        assert_eq!(choice.filters()[0].matched_count(), 1);
        assert_eq!(choice.filters()[1].matched_count(), 1);
    }

    #[test]
    fn test_otherwise_and_pass_through() {
        let other = RecordingProcessor::new();
        let choice = Choice::new(Vec::new())
            .when(header_equals("kind", "gold"), processor(|_| Ok(())))
            .otherwise(other.shared());
        choice.start().unwrap();
        process_sync(&choice, Exchange::new("x")).unwrap();
        assert_eq!(other.count(), 1);

        let empty = Choice::new(Vec::new());
        empty.start().unwrap();
        let ex = process_sync(&empty, Exchange::new("x")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(ex.body().to_text(), "x");
    }

    #[test]
    fn test_nested_choice_restores_filter_flag() {
        let inner = Choice::new(Vec::new()).when(header_equals("kind", "none"), processor(|_| Ok(())));
        inner.start().unwrap();
        let outer = Choice::new(Vec::new()).when(
            try_predicate(|_| Ok(true)),
            processor(move |ex| {
                assert_eq!(ex.properties().filter_matched, Some(true));
                Ok(())
            }),
        );
        outer.start().unwrap();
        let ex = process_sync(&outer, Exchange::new("x")).unwrap();
        assert_eq!(ex.properties().filter_matched, None);
        let ex = process_sync(&inner, Exchange::new("x")).unwrap();
        assert_eq!(ex.properties().filter_matched, None);
    }

    #[test]
    fn test_predicate_error_fails_exchange() {
        let choice = Choice::new(Vec::new()).when(try_predicate(|_| Err("bad".into())), processor(|_| Ok(())));
        choice.start().unwrap();
        let ex = process_sync(&choice, Exchange::new("x")).unwrap();
        assert!(ex.exception().unwrap().is::<RoutingError>());
    }

    #[test]
    fn test_not_started() {
        let choice = Choice::new(Vec::new());
        let ex = process_sync(&choice, Exchange::new("x")).unwrap();
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::NotStarted("choice"))
        ));
    }
}
