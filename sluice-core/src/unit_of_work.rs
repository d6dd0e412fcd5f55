//! Unit of work: the scope of completion hooks for one exchange.

use crate::{exchange::Exchange, message::Message};
use parking_lot::Mutex;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// A completion hook attached to a unit of work.
///
/// Exactly one of [`on_complete`](Synchronization::on_complete) or
/// [`on_failure`](Synchronization::on_failure) is invoked when the unit of
/// work is done. The route hooks fire each time the exchange leaves or
/// enters a route, before the owning consumer sees the result.
pub trait Synchronization: Send + Sync + 'static {
    /// The exchange completed without a failure.
    fn on_complete(&self, exchange: &mut Exchange);

    /// The exchange completed with a failure.
    fn on_failure(&self, exchange: &mut Exchange);

    /// The exchange is about to be routed by `route_id`.
    fn on_before_route(&self, _route_id: &str, _exchange: &mut Exchange) {}

    /// The exchange has been routed by `route_id`.
    fn on_after_route(&self, _route_id: &str, _exchange: &mut Exchange) {}
}

/// Tracks the synchronizations of one exchange's processing lifecycle.
pub struct UnitOfWork {
    origin: String,
    original: Message,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    routes: Mutex<Vec<String>>,
    done: AtomicBool,
}

impl UnitOfWork {
    /// Starts a unit of work for `exchange`.
    ///
    /// Completion hooks already registered on the exchange are adopted and
    /// the input message is kept as the original message.
    pub fn start(exchange: &mut Exchange) -> Arc<UnitOfWork> {
        let uow = Arc::new(UnitOfWork {
            origin: exchange.exchange_id().to_owned(),
            original: exchange.input().clone(),
            synchronizations: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        });
        exchange.set_unit_of_work(Some(Arc::clone(&uow)));
        uow
    }

    /// Id of the exchange that started this unit of work.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The input message as it was when the unit of work started.
    pub fn original_message(&self) -> &Message {
        &self.original
    }

    /// Registers a synchronization.
    pub fn add_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(sync);
    }

    /// Removes a previously registered synchronization.
    pub fn remove_synchronization(&self, sync: &Arc<dyn Synchronization>) {
        self.synchronizations
            .lock()
            .retain(|s| !Arc::ptr_eq(s, sync));
    }

    /// Returns true if `sync` is registered.
    pub fn contains_synchronization(&self, sync: &Arc<dyn Synchronization>) -> bool {
        self.synchronizations
            .lock()
            .iter()
            .any(|s| Arc::ptr_eq(s, sync))
    }

    /// Number of registered synchronizations.
    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    /// The route currently processing the exchange.
    pub fn current_route(&self) -> Option<String> {
        self.routes.lock().last().cloned()
    }

    /// Enters a route and fires the before-route hooks.
    pub fn before_route(&self, route_id: &str, exchange: &mut Exchange) {
        self.routes.lock().push(route_id.to_owned());
        for sync in self.snapshot() {
            guarded("before route", || sync.on_before_route(route_id, exchange));
        }
    }

    /// Leaves a route and fires the after-route hooks.
    pub fn after_route(&self, route_id: &str, exchange: &mut Exchange) {
        for sync in self.snapshot() {
            guarded("after route", || sync.on_after_route(route_id, exchange));
        }
        let mut routes = self.routes.lock();
        if let Some(pos) = routes.iter().rposition(|r| r == route_id) {
            routes.remove(pos);
        }
    }

    /// Returns true once [`done`](UnitOfWork::done) has fired.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Completes the unit of work, invoking every synchronization once.
    ///
    /// Hooks run in reverse registration order. Returns false if the unit
    /// of work was already done, in which case nothing is invoked.
    pub fn done(&self, exchange: &mut Exchange) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut syncs = std::mem::take(&mut *self.synchronizations.lock());
        syncs.extend(exchange.handover_completions());
        let failed = exchange.is_failed();
        tracing::trace!(
            exchange_id = exchange.exchange_id(),
            failed,
            hooks = syncs.len(),
            "unit of work done"
        );
        for sync in syncs.iter().rev() {
            if failed {
                guarded("on failure", || sync.on_failure(exchange));
            } else {
                guarded("on complete", || sync.on_complete(exchange));
            }
        }
        true
    }

    fn snapshot(&self) -> Vec<Arc<dyn Synchronization>> {
        self.synchronizations.lock().clone()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("origin", &self.origin)
            .field("synchronizations", &self.synchronization_count())
            .field("done", &self.is_done())
            .finish()
    }
}

fn guarded(stage: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(stage, "synchronization panicked, this is ignored");
    }
}
