//! Finally clauses.

use sluice_core::{AsyncCallback, AsyncProcessor, BoxError, Exchange, Service, SharedProcessor};

/// Runs its body whether or not the exchange failed.
///
/// A pending failure is lifted off the exchange while the body runs and
/// put back afterwards. If the body fails as well, its failure wins and
/// the earlier one is recorded as suppressed.
pub struct Finally {
    processor: SharedProcessor,
}

impl Finally {
    /// A finally clause running `processor`.
    pub fn new(processor: SharedProcessor) -> Self {
        Self { processor }
    }
}

impl Service for Finally {
    fn do_build(&self) -> Result<(), BoxError> {
        self.processor.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.processor.init()
    }

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

impl AsyncProcessor for Finally {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let prior = exchange.take_exception();
        if let Some(failure) = &prior {
            exchange.properties_mut().exception_caught = Some(failure.clone());
        }
        let properties = exchange.properties_mut();
        properties.failure_endpoint = properties.to_endpoint.clone();

        self.processor.process(
            exchange,
            AsyncCallback::new(move |mut exchange, done_sync| {
                match (prior, exchange.take_exception()) {
                    (Some(prior), Some(mut failure)) => {
                        failure.add_suppressed(prior);
                        exchange.set_exception(failure);
                    }
                    (Some(prior), None) => {
                        exchange.properties_mut().exception_caught = Some(prior.clone());
                        exchange.set_exception(prior);
                    }
                    (None, Some(failure)) => exchange.set_exception(failure),
                    (None, None) => exchange.properties_mut().failure_endpoint = None,
                }
                callback.done(exchange, done_sync);
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        await_manager::process_sync,
        testing::{FailingProcessor, RecordingProcessor},
    };
    use sluice_core::Failure;

    #[test]
    fn test_runs_without_failure() {
        let recorder = RecordingProcessor::new();
        let ex = process_sync(&Finally::new(recorder.shared()), Exchange::new("x")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_prior_failure_is_restored() {
        let recorder = RecordingProcessor::new();
        let finally = Finally::new(recorder.shared());
        let mut ex = Exchange::new("x");
        ex.set_exception(Failure::msg("first"));
        let ex = process_sync(&finally, ex).unwrap();
        assert_eq!(recorder.count(), 1);
        assert_eq!(ex.exception().unwrap().to_string(), "first");
    }

    #[test]
    fn test_body_failure_suppresses_prior() {
        let finally = Finally::new(FailingProcessor::new("second").shared());
        let mut ex = Exchange::new("x");
        ex.set_exception(Failure::msg("first"));
        let ex = process_sync(&finally, ex).unwrap();
        let failure = ex.exception().unwrap();
        assert_eq!(failure.to_string(), "second");
        assert_eq!(failure.suppressed().len(), 1);
        assert_eq!(failure.suppressed()[0].to_string(), "first");
    }
}
