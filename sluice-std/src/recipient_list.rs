//! Multicast to endpoints resolved per exchange.

use crate::{
    aggregate::UseLatest,
    multicast::{BranchContext, BranchSource, MulticastBuilder, MulticastProcessor, PairHooks, Pairs},
    producer_cache::{AcquiredProducer, ProducerCache},
};
use sluice_core::{
    BoxError, EndpointResolver, Exchange, RoutingError, Service, SharedAggregationStrategy,
    SharedExpression, Value,
};
use std::sync::Arc;

/// Returns the acquired producer to its cache once the branch is done, or
/// when the pair is dropped without being dispatched.
struct ReleaseProducer {
    cache: Arc<ProducerCache>,
    acquired: Option<AcquiredProducer>,
}

impl ReleaseProducer {
    fn release(&mut self) {
        if let Some(acquired) = self.acquired.take() {
            self.cache.release_producer(acquired);
        }
    }
}

impl PairHooks for ReleaseProducer {
    fn done(&mut self, exchange: &Exchange) {
        if exchange.is_failed() {
            if let Some(acquired) = &self.acquired {
                tracing::debug!(uri = acquired.uri(), "recipient failed");
            }
        }
        self.release();
    }
}

impl Drop for ReleaseProducer {
    fn drop(&mut self) {
        self.release();
    }
}

/// The branch source of a recipient list.
pub struct Recipients {
    expression: SharedExpression,
    resolver: Arc<dyn EndpointResolver>,
    cache: Arc<ProducerCache>,
    owns_cache: bool,
    delimiter: String,
    ignore_invalid_endpoints: bool,
}

impl Recipients {
    /// Resolves the uris yielded by `expression` with `resolver`.
    pub fn new(expression: SharedExpression, resolver: Arc<dyn EndpointResolver>) -> Self {
        Self {
            expression,
            resolver,
            cache: Arc::new(ProducerCache::default()),
            owns_cache: true,
            delimiter: ",".to_owned(),
            ignore_invalid_endpoints: false,
        }
    }

    /// Uses a shared producer cache instead of a private one.
    pub fn producer_cache(mut self, cache: Arc<ProducerCache>) -> Self {
        self.cache = cache;
        self.owns_cache = false;
        self
    }

    /// Sets the delimiter separating uris in a text value.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Skips uris that cannot be resolved instead of failing.
    pub fn ignore_invalid_endpoints(mut self, enabled: bool) -> Self {
        self.ignore_invalid_endpoints = enabled;
        self
    }

    /// The producer cache in use.
    pub fn cache(&self) -> &Arc<ProducerCache> {
        &self.cache
    }

    fn uris(&self, value: Value) -> Vec<String> {
        let split = |text: &str| -> Vec<String> {
            text.split(self.delimiter.as_str())
                .map(str::trim)
                .filter(|uri| !uri.is_empty())
                .map(str::to_owned)
                .collect()
        };
        match value {
            Value::Null => Vec::new(),
            Value::List(items) => items.iter().flat_map(|item| split(&item.to_text())).collect(),
            other => split(&other.to_text()),
        }
    }
}

impl Service for Recipients {
    fn do_start(&self) -> Result<(), BoxError> {
        self.cache.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        if self.owns_cache {
            self.cache.stop()?;
        }
        Ok(())
    }
}

impl BranchSource for Recipients {
    fn name(&self) -> &'static str {
        "recipient-list"
    }

    fn branches(&self, context: &BranchContext, exchange: &Exchange) -> Result<Pairs, BoxError> {
        let value = self
            .expression
            .evaluate(exchange)
            .map_err(|e| RoutingError::Expression(e.to_string()))?;
        let mut pairs = Vec::new();
        for uri in self.uris(value) {
            let Some(endpoint) = self.resolver.resolve(&uri) else {
                if self.ignore_invalid_endpoints {
                    tracing::debug!(%uri, "ignoring unresolvable recipient");
                    continue;
                }
                return Err(RoutingError::NoSuchEndpoint(uri).into());
            };
            let acquired = match self.cache.acquire_producer(endpoint.as_ref()) {
                Ok(acquired) => acquired,
                Err(error) if self.ignore_invalid_endpoints => {
                    tracing::debug!(%uri, %error, "ignoring recipient without producer");
                    continue;
                }
                Err(error) => return Err(error),
            };
            let producer = Arc::clone(acquired.producer());
            let hooks = ReleaseProducer {
                cache: Arc::clone(&self.cache),
                acquired: Some(acquired),
            };
            let index = pairs.len();
            let mut copy = context.copy(exchange, index);
            copy.properties_mut().to_endpoint = Some(uri);
            pairs.push(context.pair(index, producer, copy, false)?.with_hooks(hooks));
        }
        Ok(Pairs::from_vec(pairs))
    }

    fn default_strategy(&self) -> Option<SharedAggregationStrategy> {
        Some(Arc::new(UseLatest))
    }
}

/// A recipient list.
pub type RecipientList = MulticastProcessor<Recipients>;

impl MulticastProcessor<Recipients> {
    /// Starts building a recipient list.
    pub fn recipient_list(recipients: Recipients) -> MulticastBuilder<Recipients> {
        MulticastBuilder::new(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        await_manager::process_sync,
        testing::{MockEndpoint, MockResolver},
    };
    use sluice_core::header;

    fn resolver() -> (Arc<MockResolver>, Arc<MockEndpoint>, Arc<MockEndpoint>) {
        let a = Arc::new(MockEndpoint::new("mock:a"));
        let b = Arc::new(MockEndpoint::new("mock:b"));
        let resolver = MockResolver::new().with(a.clone()).with(b.clone());
        (Arc::new(resolver), a, b)
    }

    #[test]
    fn test_routes_to_each_recipient() {
        let (resolver, a, b) = resolver();
        let list = RecipientList::recipient_list(Recipients::new(header("to"), resolver)).build();
        let ex = process_sync(&list, Exchange::new("hi").with_header("to", "mock:a, mock:b")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(a.received().len(), 1);
        assert_eq!(b.received().len(), 1);
        assert_eq!(ex.properties().to_endpoint.as_deref(), Some("mock:b"));
        assert_eq!(list.source().cache().statistics().in_use(), 0);
    }

    #[test]
    fn test_unknown_recipient_fails_without_leaking() {
        let (resolver, a, _) = resolver();
        let list = RecipientList::recipient_list(Recipients::new(header("to"), resolver)).build();
        let ex = process_sync(&list, Exchange::new("hi").with_header("to", "mock:a,mock:nope")).unwrap();
        assert!(matches!(
            ex.exception().unwrap().find::<RoutingError>(),
            Some(RoutingError::NoSuchEndpoint(uri)) if uri == "mock:nope"
        ));
        assert!(a.received().is_empty());
        let stats = list.source().cache().statistics();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.in_use(), 0);
    }

    #[test]
    fn test_ignore_invalid_endpoints() {
        let (resolver, a, _) = resolver();
        let recipients = Recipients::new(header("to"), resolver)
            .delimiter(";")
            .ignore_invalid_endpoints(true);
        let list = RecipientList::recipient_list(recipients).build();
        let ex = process_sync(&list, Exchange::new("hi").with_header("to", "mock:nope;mock:a")).unwrap();
        assert!(!ex.is_failed());
        assert_eq!(a.received().len(), 1);
    }
}
