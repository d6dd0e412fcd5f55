//! Completion callbacks run once per exchange.
//!
//! [`OnCompletion`] registers a synchronization on the exchange's unit of
//! work and passes the exchange on unchanged. When the unit of work is
//! done the body runs, either on the exchange itself or, with an
//! executor, on a correlated copy handed to that executor.
//!
//! In before-consumer mode the body runs when the exchange leaves the
//! route, so the consumer sees what the body did. Otherwise it runs once
//! the unit of work is done.

use crate::await_manager::process_sync;
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Exchange, Message, Service, SharedExecutor,
    SharedPredicate, SharedProcessor, Synchronization,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// When and how the completion body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OnCompletionOptions {
    /// Skip exchanges that failed.
    pub only_on_complete: bool,
    /// Skip exchanges that succeeded.
    pub only_on_failure: bool,
    /// Run when the exchange leaves the route instead of when its unit of
    /// work is done.
    pub before_consumer: bool,
    /// Run the body on the message the exchange entered the route with.
    pub use_original_message: bool,
}

struct Shared {
    processor: SharedProcessor,
    options: OnCompletionOptions,
    on_when: Option<SharedPredicate>,
    executor: Option<SharedExecutor>,
    fired: AtomicUsize,
}

impl Shared {
    fn wanted(&self, failed: bool) -> bool {
        !((failed && self.options.only_on_complete) || (!failed && self.options.only_on_failure))
    }

    fn on_when_matches(&self, exchange: &Exchange) -> bool {
        let Some(on_when) = &self.on_when else {
            return true;
        };
        on_when.matches(exchange).unwrap_or_else(|error| {
            tracing::warn!(%error, "on completion predicate failed, body skipped");
            false
        })
    }

    fn fire(self: &Arc<Self>, exchange: &mut Exchange) {
        if !self.wanted(exchange.is_failed()) || !self.on_when_matches(exchange) {
            return;
        }
        self.fired.fetch_add(1, Ordering::Relaxed);
        let original = self
            .options
            .use_original_message
            .then(|| exchange.unit_of_work().map(|uow| uow.original_message().clone()))
            .flatten();
        match &self.executor {
            Some(executor) => {
                let mut copy = exchange.correlated_copy(false);
                prepare(&mut copy, original);
                let shared = Arc::clone(self);
                let submitted = executor.submit(Box::new(move || {
                    let mut copy = copy;
                    shared.run(&mut copy);
                }));
                if let Err(error) = submitted {
                    tracing::warn!(%error, "on completion executor refused the body, it is skipped");
                }
            }
            None => {
                let saved = original
                    .is_some()
                    .then(|| (exchange.input().clone(), exchange.take_output()));
                prepare(exchange, original);
                self.run(exchange);
                exchange.properties_mut().on_completion = false;
                if let Some((input, output)) = saved {
                    exchange.set_input(input);
                    if let Some(output) = output {
                        exchange.set_output(output);
                    }
                }
            }
        }
    }

    /// Runs the body with the failure and routing flags hidden, then puts
    /// them back.
    fn run(&self, exchange: &mut Exchange) {
        let failure = exchange.take_exception();
        let route_stop = exchange.is_route_stop();
        let error_handled = exchange.is_error_handled();
        let rollback_only = exchange.is_rollback_only();
        let rollback_only_last = exchange.is_rollback_only_last();
        let failure_handled = std::mem::take(&mut exchange.properties_mut().failure_handled);
        exchange.set_route_stop(false);
        exchange.set_error_handled(false);
        exchange.set_rollback_only(false);
        exchange.set_rollback_only_last(false);

        let owned = std::mem::take(exchange);
        match process_sync(self.processor.as_ref(), owned) {
            Ok(done) => *exchange = done,
            Err(error) => tracing::warn!(%error, "on completion body lost the exchange"),
        }
        if let Some(error) = exchange.exception() {
            tracing::warn!(%error, "on completion body failed, this is ignored");
        }

        exchange.replace_exception(failure);
        exchange.set_route_stop(route_stop);
        exchange.set_error_handled(error_handled);
        exchange.set_rollback_only(rollback_only);
        exchange.set_rollback_only_last(rollback_only_last);
        exchange.properties_mut().failure_handled = failure_handled;
    }
}

fn prepare(exchange: &mut Exchange, original: Option<Message>) {
    if let Some(original) = original {
        exchange.set_input(original);
        exchange.take_output();
    }
    exchange.properties_mut().on_completion = true;
}

struct Hook {
    shared: Arc<Shared>,
    fired: AtomicBool,
}

impl Hook {
    fn fire_once(&self, exchange: &mut Exchange) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.shared.fire(exchange);
        }
    }
}

impl Synchronization for Hook {
    fn on_complete(&self, exchange: &mut Exchange) {
        if !self.shared.options.before_consumer {
            self.fire_once(exchange);
        }
    }

    fn on_failure(&self, exchange: &mut Exchange) {
        if !self.shared.options.before_consumer {
            self.fire_once(exchange);
        }
    }

    fn on_after_route(&self, _route_id: &str, exchange: &mut Exchange) {
        if self.shared.options.before_consumer {
            self.fire_once(exchange);
        }
    }
}

/// Registers a body to run once the exchange is done.
pub struct OnCompletion {
    shared: Arc<Shared>,
}

/// Builds an [`OnCompletion`].
pub struct OnCompletionBuilder {
    processor: SharedProcessor,
    options: OnCompletionOptions,
    on_when: Option<SharedPredicate>,
    executor: Option<SharedExecutor>,
}

impl OnCompletionBuilder {
    /// Replaces all options.
    pub fn options(mut self, options: OnCompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs only for exchanges that succeeded.
    pub fn only_on_complete(mut self) -> Self {
        self.options.only_on_complete = true;
        self.options.only_on_failure = false;
        self
    }

    /// Runs only for exchanges that failed.
    pub fn only_on_failure(mut self) -> Self {
        self.options.only_on_failure = true;
        self.options.only_on_complete = false;
        self
    }

    /// Runs when the exchange leaves the route.
    pub fn before_consumer(mut self) -> Self {
        self.options.before_consumer = true;
        self
    }

    /// Runs the body on the original input message.
    pub fn use_original_message(mut self) -> Self {
        self.options.use_original_message = true;
        self
    }

    /// Runs only when `predicate` matches.
    pub fn on_when(mut self, predicate: SharedPredicate) -> Self {
        self.on_when = Some(predicate);
        self
    }

    /// Runs the body on `executor`, on a correlated copy.
    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the processor.
    pub fn build(self) -> OnCompletion {
        OnCompletion {
            shared: Arc::new(Shared {
                processor: self.processor,
                options: self.options,
                on_when: self.on_when,
                executor: self.executor,
                fired: AtomicUsize::new(0),
            }),
        }
    }
}

impl OnCompletion {
    /// Starts a builder for `processor`.
    pub fn builder(processor: SharedProcessor) -> OnCompletionBuilder {
        OnCompletionBuilder {
            processor,
            options: OnCompletionOptions::default(),
            on_when: None,
            executor: None,
        }
    }

    /// The configured options.
    pub fn options(&self) -> OnCompletionOptions {
        self.shared.options
    }

    /// Number of times the body was started.
    pub fn fired_count(&self) -> usize {
        self.shared.fired.load(Ordering::Relaxed)
    }
}

impl Service for OnCompletion {
    fn do_build(&self) -> Result<(), BoxError> {
        self.shared.processor.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.shared.processor.init()
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.shared.processor.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.shared.processor.stop()
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.shared.processor.shutdown()
    }
}

impl AsyncProcessor for OnCompletion {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        // Completion bodies do not register further completions.
        if !exchange.properties().on_completion {
            exchange.add_on_completion(Arc::new(Hook {
                shared: Arc::clone(&self.shared),
                fired: AtomicBool::new(false),
            }));
        }
        callback.done(exchange, true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        internal::Route,
        pipeline::Pipeline,
        testing::{FailingProcessor, RecordingProcessor},
    };
    use sluice_core::{Value, processor, shared};

    fn route(steps: Vec<SharedProcessor>) -> Route {
        Route::new("test", shared(Pipeline::new(steps)))
    }

    #[test]
    fn test_fires_once_per_exchange() {
        let recorder = RecordingProcessor::new();
        let on_completion = Arc::new(OnCompletion::builder(recorder.shared()).build());
        let route = route(vec![on_completion.clone()]);
        let ex = route.send(Exchange::new("a")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(recorder.count(), 1);
        route.send(Exchange::new("b")).unwrap();
        assert_eq!(recorder.count(), 2);
        assert_eq!(on_completion.fired_count(), 2);
    }

    #[test]
    fn test_only_on_failure() {
        let recorder = RecordingProcessor::new();
        let on_failure = Arc::new(OnCompletion::builder(recorder.shared()).only_on_failure().build());
        route(vec![on_failure.clone()]).send(Exchange::new("ok")).unwrap();
        assert_eq!(recorder.count(), 0);

        let ex = route(vec![on_failure.clone(), FailingProcessor::new("boom").shared()])
            .send(Exchange::new("bad"))
            .unwrap();
        assert_eq!(recorder.count(), 1);
        assert_eq!(ex.exception().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_failure_is_hidden_from_body() {
        let seen_failed = Arc::new(AtomicBool::new(true));
        let seen = seen_failed.clone();
        let body = processor(move |ex| {
            seen.store(ex.is_failed(), Ordering::SeqCst);
            Ok(())
        });
        let on_completion = Arc::new(OnCompletion::builder(body).build());
        let ex = route(vec![on_completion, FailingProcessor::new("boom").shared()])
            .send(Exchange::new("x"))
            .unwrap();
        assert!(!seen_failed.load(Ordering::SeqCst));
        assert!(ex.is_failed());
    }

    #[test]
    fn test_before_consumer_changes_are_visible() {
        let body = processor(|ex| {
            ex.set_body("audited");
            Ok(())
        });
        let on_completion = Arc::new(OnCompletion::builder(body).before_consumer().build());
        let set = processor(|ex| {
            ex.set_body("processed");
            Ok(())
        });
        let ex = route(vec![on_completion, set]).send(Exchange::new("x")).unwrap();
        assert_eq!(ex.body(), &Value::from("audited"));
    }

    #[test]
    fn test_use_original_message() {
        let recorder = RecordingProcessor::new();
        let on_completion = Arc::new(
            OnCompletion::builder(recorder.shared())
                .use_original_message()
                .build(),
        );
        let set = processor(|ex| {
            ex.set_body("processed");
            Ok(())
        });
        let ex = route(vec![on_completion, set]).send(Exchange::new("original")).unwrap();
        assert_eq!(recorder.bodies(), vec![Value::from("original")]);
        assert_eq!(ex.body(), &Value::from("processed"));
    }

    #[test]
    fn test_on_when() {
        let recorder = RecordingProcessor::new();
        let on_completion = Arc::new(
            OnCompletion::builder(recorder.shared())
                .on_when(sluice_core::header_equals("audit", true))
                .build(),
        );
        route(vec![on_completion.clone()]).send(Exchange::new("x")).unwrap();
        route(vec![on_completion])
            .send(Exchange::new("x").with_header("audit", true))
            .unwrap();
        assert_eq!(recorder.count(), 1);
    }
}
