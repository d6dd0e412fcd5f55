//! Per-component cache of endpoint producers.
//!
//! Producers are created on first use and kept, keyed by endpoint uri, up
//! to a bounded capacity. Every [`acquire_producer`](ProducerCache::acquire_producer)
//! hands out an [`AcquiredProducer`] that must be given back through
//! [`release_producer`](ProducerCache::release_producer); the handle is
//! consumed by the release, so it cannot be released twice.

use dashmap::DashMap;
use sluice_core::{BoxError, Endpoint, Service, SharedProcessor};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// A producer checked out of a [`ProducerCache`].
#[must_use = "an acquired producer must be released"]
pub struct AcquiredProducer {
    uri: String,
    producer: SharedProcessor,
    cached: bool,
}

impl AcquiredProducer {
    /// The endpoint uri.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The producer.
    pub fn producer(&self) -> &SharedProcessor {
        &self.producer
    }

    /// Returns true if the producer is kept by the cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl fmt::Debug for AcquiredProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredProducer")
            .field("uri", &self.uri)
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

/// Counters of a producer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerCacheStatistics {
    /// Producers created.
    pub created: usize,
    /// Acquisitions.
    pub acquired: usize,
    /// Releases.
    pub released: usize,
}

impl ProducerCacheStatistics {
    /// Producers currently checked out.
    pub fn in_use(&self) -> usize {
        self.acquired.saturating_sub(self.released)
    }
}

/// A bounded, concurrent map of producers keyed by endpoint uri.
pub struct ProducerCache {
    producers: DashMap<String, SharedProcessor>,
    capacity: usize,
    created: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl fmt::Debug for ProducerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerCache")
            .field("size", &self.producers.len())
            .field("capacity", &self.capacity)
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl Default for ProducerCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ProducerCache {
    /// A cache keeping at most `capacity` producers.
    pub fn new(capacity: usize) -> Self {
        Self {
            producers: DashMap::new(),
            capacity,
            created: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Checks out the producer for `endpoint`, creating and starting it on
    /// first use.
    pub fn acquire_producer(&self, endpoint: &dyn Endpoint) -> Result<AcquiredProducer, BoxError> {
        let uri = endpoint.uri();
        let existing = self.producers.get(uri).map(|p| Arc::clone(p.value()));
        let (producer, cached) = match existing {
            Some(producer) => (producer, true),
            None => {
                let producer = endpoint.create_producer()?;
                producer.start()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(uri, "created producer");
                if self.producers.len() < self.capacity {
                    let entry = self
                        .producers
                        .entry(uri.to_owned())
                        .or_insert(producer);
                    (Arc::clone(entry.value()), true)
                } else {
                    (producer, false)
                }
            }
        };
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(AcquiredProducer {
            uri: uri.to_owned(),
            producer,
            cached,
        })
    }

    /// Gives a producer back. Producers the cache had no room for are
    /// stopped.
    pub fn release_producer(&self, acquired: AcquiredProducer) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if !acquired.cached {
            if let Err(error) = acquired.producer.stop() {
                tracing::warn!(uri = %acquired.uri, %error, "failed to stop producer");
            }
        }
    }

    /// Number of cached producers.
    pub fn size(&self) -> usize {
        self.producers.len()
    }

    /// Maximum number of cached producers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if a producer for `uri` is cached.
    pub fn contains(&self, uri: &str) -> bool {
        self.producers.contains_key(uri)
    }

    /// Current counters.
    pub fn statistics(&self) -> ProducerCacheStatistics {
        ProducerCacheStatistics {
            created: self.created.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl Service for ProducerCache {
    fn do_stop(&self) -> Result<(), BoxError> {
        let producers: Vec<_> = self
            .producers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.producers.clear();
        producers.iter().try_for_each(|p| p.stop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;

    #[test]
    fn test_producers_are_reused() {
        let cache = ProducerCache::new(10);
        let endpoint = MockEndpoint::new("mock:a");
        let first = cache.acquire_producer(&endpoint).unwrap();
        let second = cache.acquire_producer(&endpoint).unwrap();
        assert!(Arc::ptr_eq(first.producer(), second.producer()));
        cache.release_producer(first);
        cache.release_producer(second);
        let stats = cache.statistics();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.in_use(), 0);
        assert_eq!(endpoint.producers_created(), 1);
    }

    #[test]
    fn test_over_capacity_is_not_cached() {
        let cache = ProducerCache::new(1);
        let a = cache.acquire_producer(&MockEndpoint::new("mock:a")).unwrap();
        let b = cache.acquire_producer(&MockEndpoint::new("mock:b")).unwrap();
        assert!(a.is_cached());
        assert!(!b.is_cached());
        assert_eq!(cache.size(), 1);
        cache.release_producer(a);
        cache.release_producer(b);
    }

    #[test]
    fn test_create_failure_is_returned() {
        let cache = ProducerCache::new(1);
        assert!(cache.acquire_producer(&MockEndpoint::failing("mock:broken")).is_err());
        assert_eq!(cache.statistics().acquired, 0);
    }
}
