//! Testing utilities for Sluice.
//!
//! This module provides processors and endpoints that make routing
//! behaviour observable in tests.
//!
//! # Features
//!
//! - [`RecordingProcessor`]: Records every exchange it receives
//! - [`FailingProcessor`]: Fails every exchange with a fixed error
//! - [`SetBodyProcessor`]: Replaces the body
//! - [`AsyncDelayProcessor`]: Completes from another thread after a delay
//! - [`CountingProcessor`]: Counts invocations
//! - [`MockEndpoint`] / [`MockResolver`]: Endpoints backed by recording producers

use parking_lot::Mutex;
use sluice_core::{
    AsyncCallback, AsyncProcessor, BoxError, Endpoint, EndpointResolver, Exchange, Failure,
    Service, SharedProcessor, Value,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

// ============================================================================
// Recording Processor
// ============================================================================

/// A processor that records the body and id of every exchange it receives.
///
/// # Example
///
/// ```rust,ignore
/// let recorder = RecordingProcessor::new();
/// let pipeline = Pipeline::new(vec![recorder.shared()]);
///
/// process_sync(&pipeline, Exchange::new("a"))?;
/// assert_eq!(recorder.bodies(), vec![Value::from("a")]);
/// ```
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    received: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingProcessor {
    /// Create a new recording processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared processor recording into this recorder.
    pub fn shared(&self) -> SharedProcessor {
        Arc::new(self.clone())
    }

    /// The recorded bodies, in arrival order.
    pub fn bodies(&self) -> Vec<Value> {
        self.received.lock().iter().map(|(_, b)| b.clone()).collect()
    }

    /// The recorded exchange ids, in arrival order.
    pub fn exchange_ids(&self) -> Vec<String> {
        self.received.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Number of recorded exchanges.
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    /// Clear all recorded exchanges.
    pub fn clear(&self) {
        self.received.lock().clear();
    }
}

impl Service for RecordingProcessor {}

impl AsyncProcessor for RecordingProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.received
            .lock()
            .push((exchange.exchange_id().to_owned(), exchange.body().clone()));
        callback.done(exchange, true);
        true
    }
}

// ============================================================================
// Failing Processor
// ============================================================================

/// A processor that fails every exchange.
#[derive(Clone)]
pub struct FailingProcessor {
    failure: Arc<dyn Fn() -> Failure + Send + Sync>,
}

impl FailingProcessor {
    /// Fails with a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            failure: Arc::new(move || Failure::msg(message.clone())),
        }
    }

    /// Fails with errors built by `make`.
    pub fn with_error<E, F>(make: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        Self {
            failure: Arc::new(move || Failure::new(make())),
        }
    }

    /// This processor as a shared processor.
    pub fn shared(self) -> SharedProcessor {
        Arc::new(self)
    }
}

impl Service for FailingProcessor {}

impl AsyncProcessor for FailingProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        exchange.set_exception((self.failure)());
        callback.done(exchange, true);
        true
    }
}

// ============================================================================
// Set Body Processor
// ============================================================================

/// A processor replacing the input body.
#[derive(Debug, Clone)]
pub struct SetBodyProcessor {
    body: Value,
}

impl SetBodyProcessor {
    /// Sets the body to `body`.
    pub fn new(body: impl Into<Value>) -> Self {
        Self { body: body.into() }
    }

    /// This processor as a shared processor.
    pub fn shared(self) -> SharedProcessor {
        Arc::new(self)
    }
}

impl Service for SetBodyProcessor {}

impl AsyncProcessor for SetBodyProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        exchange.set_body(self.body.clone());
        callback.done(exchange, true);
        true
    }
}

// ============================================================================
// Async Delay Processor
// ============================================================================

/// A processor that completes from a spawned thread after a delay,
/// optionally appending a suffix to the body text.
#[derive(Debug, Clone)]
pub struct AsyncDelayProcessor {
    delay: Duration,
    suffix: Option<String>,
}

impl AsyncDelayProcessor {
    /// Completes after `delay` without touching the exchange.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            suffix: None,
        }
    }

    /// Appends `suffix` to the body text before completing.
    pub fn appending(delay: Duration, suffix: impl Into<String>) -> Self {
        Self {
            delay,
            suffix: Some(suffix.into()),
        }
    }

    /// This processor as a shared processor.
    pub fn shared(self) -> SharedProcessor {
        Arc::new(self)
    }
}

impl Service for AsyncDelayProcessor {}

impl AsyncProcessor for AsyncDelayProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let delay = self.delay;
        let suffix = self.suffix.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if let Some(suffix) = suffix {
                let body = format!("{}{suffix}", exchange.body());
                exchange.set_body(body);
            }
            callback.done(exchange, false);
        });
        false
    }
}

// ============================================================================
// Counting Processor
// ============================================================================

/// A processor counting how often it was invoked.
#[derive(Debug, Clone, Default)]
pub struct CountingProcessor {
    count: Arc<AtomicUsize>,
}

impl CountingProcessor {
    /// Create a new counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared processor counting into this counter.
    pub fn shared(&self) -> SharedProcessor {
        Arc::new(self.clone())
    }

    /// Number of invocations so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Service for CountingProcessor {}

impl AsyncProcessor for CountingProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst);
        callback.done(exchange, true);
        true
    }
}

// ============================================================================
// Mock Endpoints
// ============================================================================

/// An endpoint whose producer records what it receives.
pub struct MockEndpoint {
    uri: String,
    recorder: RecordingProcessor,
    created: AtomicUsize,
    broken: bool,
}

impl MockEndpoint {
    /// A working endpoint at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            recorder: RecordingProcessor::new(),
            created: AtomicUsize::new(0),
            broken: false,
        }
    }

    /// An endpoint whose producer cannot be created.
    pub fn failing(uri: impl Into<String>) -> Self {
        Self {
            broken: true,
            ..Self::new(uri)
        }
    }

    /// Bodies received by producers of this endpoint.
    pub fn received(&self) -> Vec<Value> {
        self.recorder.bodies()
    }

    /// Number of producers created.
    pub fn producers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<SharedProcessor, BoxError> {
        if self.broken {
            return Err(format!("cannot create producer for {}", self.uri).into());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.recorder.shared())
    }
}

/// A resolver over a fixed set of mock endpoints.
#[derive(Default)]
pub struct MockResolver {
    endpoints: HashMap<String, Arc<MockEndpoint>>,
}

impl MockResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` under its uri.
    pub fn with(mut self, endpoint: Arc<MockEndpoint>) -> Self {
        self.endpoints.insert(endpoint.uri.clone(), endpoint);
        self
    }
}

impl EndpointResolver for MockResolver {
    fn resolve(&self, uri: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .get(uri)
            .map(|endpoint| Arc::clone(endpoint) as Arc<dyn Endpoint>)
    }
}
