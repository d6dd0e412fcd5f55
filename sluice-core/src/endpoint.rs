//! Seams to the endpoint and error-handler layers.
//!
//! Endpoint resolution and error handling live outside the routing core;
//! these traits are the narrow views the core needs of them.

use crate::{error::BoxError, processor::SharedProcessor};
use std::sync::Arc;

/// A destination identified by a uri that can create producers.
pub trait Endpoint: Send + Sync + 'static {
    /// The uri of this endpoint.
    fn uri(&self) -> &str;

    /// Creates a producer sending exchanges to this endpoint.
    fn create_producer(&self) -> Result<SharedProcessor, BoxError>;
}

/// Resolves endpoint uris.
pub trait EndpointResolver: Send + Sync + 'static {
    /// Looks up the endpoint for `uri`, returning `None` when there is none.
    fn resolve(&self, uri: &str) -> Option<Arc<dyn Endpoint>>;
}

/// Wraps processors in an error handler.
pub trait ErrorHandlerFactory: Send + Sync + 'static {
    /// Returns `processor` wrapped in a new error handler.
    fn wrap(&self, processor: SharedProcessor) -> Result<SharedProcessor, BoxError>;
}
