#![allow(dead_code)]

use sluice::{
    Exchange, SharedExecutor, SharedProcessor, TokioExecutor, TokioExecutorOptions, processor,
};
use std::{
    sync::{Arc, Once},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Setup
// ============================================================================

static TRACING: Once = Once::new();

/// Installs a subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A multi-threaded runtime with its executor service.
pub fn runtime() -> (Runtime, SharedExecutor) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .unwrap();
    let executor = TokioExecutor::new(runtime.handle().clone(), TokioExecutorOptions::named("test"));
    (runtime, Arc::new(executor))
}

/// Polls `done` for up to two seconds.
pub fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ============================================================================
// Test Processors
// ============================================================================

/// Appends `suffix` to the body text, writing the out message.
pub fn append(suffix: &'static str) -> SharedProcessor {
    processor(move |ex| {
        let body = format!("{}{suffix}", ex.body());
        ex.output_mut().set_body(body);
        Ok(())
    })
}

/// Prefixes the body text with `tag:`.
pub fn tag(tag: &'static str) -> SharedProcessor {
    processor(move |ex| {
        let body = format!("{tag}:{}", ex.body());
        ex.set_body(body);
        Ok(())
    })
}

/// Text of the body.
pub fn text(exchange: &Exchange) -> String {
    exchange.body().to_text()
}
