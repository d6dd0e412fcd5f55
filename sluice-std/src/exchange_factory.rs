//! Pooled exchange factory.
//!
//! Fan-out processors create one correlated copy per branch. The factory
//! recycles those copies: every exchange it hands out carries a lease, and
//! [`PooledExchangeFactory::release`] takes the lease back and returns the
//! reset exchange to the free list. A leased exchange that is dropped
//! instead is counted as discarded.

use crate::pool::{PoolOptions, PoolSnapshot, PoolStatistics};
use parking_lot::Mutex;
use sluice_core::{Exchange, ExchangeLease};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned when releasing an exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The exchange was not acquired from any factory.
    #[error("exchange {exchange_id} was not acquired from a pooled factory")]
    NotLeased {
        /// Id of the offending exchange.
        exchange_id: String,
    },

    /// The exchange was acquired from a different factory.
    #[error("exchange {exchange_id} belongs to another factory")]
    ForeignLease {
        /// Id of the offending exchange.
        exchange_id: String,
    },
}

struct FactoryInner {
    id: u64,
    free: Mutex<Vec<Exchange>>,
    capacity: usize,
    statistics: PoolStatistics,
}

struct Lease {
    factory: Arc<FactoryInner>,
}

impl ExchangeLease for Lease {
    fn owner(&self) -> u64 {
        self.factory.id
    }

    fn discard(self: Box<Self>) {
        self.factory.statistics.record_discarded();
    }
}

/// Creates and recycles correlated exchange copies.
#[derive(Clone)]
pub struct PooledExchangeFactory {
    inner: Arc<FactoryInner>,
}

impl PooledExchangeFactory {
    /// Creates a factory with its own free list.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
                free: Mutex::new(Vec::with_capacity(options.capacity)),
                capacity: options.capacity,
                statistics: PoolStatistics::default(),
            }),
        }
    }

    /// Identity of this factory, reported by the leases it hands out.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Creates a leased correlated copy of `parent`.
    pub fn create_correlated_copy(&self, parent: &Exchange, share_unit_of_work: bool) -> Exchange {
        let mut exchange = self.acquire();
        exchange.reinit_from(parent, share_unit_of_work);
        exchange
    }

    /// Creates a fresh leased exchange with an empty message.
    pub fn create(&self) -> Exchange {
        self.acquire()
    }

    fn acquire(&self) -> Exchange {
        let recycled = self.inner.free.lock().pop();
        let mut exchange = match recycled {
            Some(exchange) => exchange,
            None => {
                self.inner.statistics.record_created();
                Exchange::default()
            }
        };
        self.inner.statistics.record_acquired();
        exchange.set_lease(Box::new(Lease {
            factory: Arc::clone(&self.inner),
        }));
        exchange
    }

    /// Returns an exchange acquired from this factory.
    ///
    /// Exchanges without a lease, or leased by another factory, are
    /// rejected; the latter still count against their own factory.
    pub fn release(&self, mut exchange: Exchange) -> Result<(), PoolError> {
        let Some(lease) = exchange.take_lease() else {
            return Err(PoolError::NotLeased {
                exchange_id: exchange.exchange_id().to_owned(),
            });
        };
        if lease.owner() != self.inner.id {
            let exchange_id = exchange.exchange_id().to_owned();
            exchange.set_lease(lease);
            return Err(PoolError::ForeignLease { exchange_id });
        }
        exchange.reset();
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.capacity {
            free.push(exchange);
            self.inner.statistics.record_released();
        } else {
            drop(free);
            self.inner.statistics.record_discarded();
        }
        Ok(())
    }

    /// Releases `exchange` if it came from this factory, else drops it.
    pub fn release_or_drop(&self, exchange: Exchange) {
        if exchange.lease_owner() == Some(self.inner.id) {
            if let Err(error) = self.release(exchange) {
                tracing::warn!(%error, "error releasing exchange, this is ignored");
            }
        }
    }

    /// Number of idle exchanges.
    pub fn size(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Maximum number of idle exchanges.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The factory's counters.
    pub fn statistics(&self) -> PoolSnapshot {
        self.inner.statistics.snapshot()
    }
}

impl Default for PooledExchangeFactory {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl std::fmt::Debug for PooledExchangeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledExchangeFactory")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("statistics", &self.inner.statistics)
            .finish()
    }
}
