//! Service lifecycle: build, init, start, stop, shutdown.
//!
//! The surrounding container drives every processor through the lifecycle
//! in this fixed order. Implementors override the `do_*` hooks; the
//! provided methods advance through skipped stages (starting a new service
//! builds and initialises it first) and refuse any transition once the
//! service has been shut down.

use crate::error::{BoxError, LifecycleError};
use parking_lot::Mutex;

/// The lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceStatus {
    /// Constructed, nothing run yet.
    New,
    /// `build` completed.
    Built,
    /// `init` completed.
    Initialized,
    /// Running.
    Started,
    /// Stopped; may be started again.
    Stopped,
    /// Terminal.
    Shutdown,
}

impl ServiceStatus {
    fn name(self) -> &'static str {
        match self {
            ServiceStatus::New => "new",
            ServiceStatus::Built => "built",
            ServiceStatus::Initialized => "initialized",
            ServiceStatus::Started => "started",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Shutdown => "shutdown",
        }
    }
}

/// Guard holding the current [`ServiceStatus`] of a stateful service.
#[derive(Debug)]
pub struct ServiceState {
    status: Mutex<ServiceStatus>,
}

impl ServiceState {
    /// A guard in the [`ServiceStatus::New`] state.
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ServiceStatus::New),
        }
    }

    /// The current status.
    pub fn status(&self) -> ServiceStatus {
        *self.status.lock()
    }

    /// Returns true while started.
    pub fn is_started(&self) -> bool {
        self.status() == ServiceStatus::Started
    }

    /// Returns true once stopped or shut down.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.status(),
            ServiceStatus::Stopped | ServiceStatus::Shutdown
        )
    }

    fn set(&self, status: ServiceStatus) {
        *self.status.lock() = status;
    }

    fn check(&self, action: &'static str) -> Result<ServiceStatus, LifecycleError> {
        let status = self.status();
        if status == ServiceStatus::Shutdown {
            return Err(LifecycleError::InvalidTransition {
                action,
                state: status.name(),
            });
        }
        Ok(status)
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle hooks of a processor or other engine component.
///
/// Stateless services need not override anything. A service that returns
/// a [`ServiceState`] from [`service_state`](Service::service_state) gets
/// ordered, idempotent transitions.
pub trait Service: Send + Sync {
    /// The lifecycle guard, if this service tracks its state.
    fn service_state(&self) -> Option<&ServiceState> {
        None
    }

    /// Hook run by [`build`](Service::build).
    fn do_build(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Hook run by [`init`](Service::init).
    fn do_init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Hook run by [`start`](Service::start).
    fn do_start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Hook run by [`stop`](Service::stop).
    fn do_stop(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Hook run by [`shutdown`](Service::shutdown).
    fn do_shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Builds the service.
    fn build(&self) -> Result<(), BoxError> {
        let Some(state) = self.service_state() else {
            return self.do_build();
        };
        if state.check("build")? == ServiceStatus::New {
            self.do_build()?;
            state.set(ServiceStatus::Built);
        }
        Ok(())
    }

    /// Initialises the service, building it first if needed.
    fn init(&self) -> Result<(), BoxError> {
        let Some(state) = self.service_state() else {
            return self.do_init();
        };
        if state.check("init")? == ServiceStatus::New {
            self.build()?;
        }
        if state.status() == ServiceStatus::Built {
            self.do_init()?;
            state.set(ServiceStatus::Initialized);
        }
        Ok(())
    }

    /// Starts the service, initialising it first if needed.
    fn start(&self) -> Result<(), BoxError> {
        let Some(state) = self.service_state() else {
            return self.do_start();
        };
        if state.check("start")? < ServiceStatus::Initialized {
            self.init()?;
        }
        if matches!(
            state.status(),
            ServiceStatus::Initialized | ServiceStatus::Stopped
        ) {
            self.do_start()?;
            state.set(ServiceStatus::Started);
        }
        Ok(())
    }

    /// Stops a started service.
    fn stop(&self) -> Result<(), BoxError> {
        let Some(state) = self.service_state() else {
            return self.do_stop();
        };
        if state.status() == ServiceStatus::Started {
            self.do_stop()?;
            state.set(ServiceStatus::Stopped);
        }
        Ok(())
    }

    /// Shuts the service down, stopping it first if needed.
    fn shutdown(&self) -> Result<(), BoxError> {
        let Some(state) = self.service_state() else {
            return self.do_shutdown();
        };
        match state.status() {
            ServiceStatus::Shutdown => Ok(()),
            status => {
                if status == ServiceStatus::Started {
                    self.stop()?;
                }
                self.do_shutdown()?;
                state.set(ServiceStatus::Shutdown);
                Ok(())
            }
        }
    }
}

/// Components that take part in graceful shutdown.
pub trait ShutdownAware {
    /// Asks the component to prepare for shutdown.
    ///
    /// `suspend_only` is set when the route is being suspended rather than
    /// stopped; `forced` when the shutdown timeout has elapsed.
    fn prepare_shutdown(&self, suspend_only: bool, forced: bool);

    /// Number of exchanges the component still has in flight.
    fn pending_exchanges(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracked {
        state: ServiceState,
        builds: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Service for Tracked {
        fn service_state(&self) -> Option<&ServiceState> {
            Some(&self.state)
        }

        fn do_build(&self) -> Result<(), BoxError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn do_start(&self) -> Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn do_stop(&self) -> Result<(), BoxError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_start_runs_earlier_stages_once() {
        let svc = Tracked::default();
        svc.start().unwrap();
        svc.start().unwrap();
        assert_eq!(svc.state.status(), ServiceStatus::Started);
        assert_eq!(svc.builds.load(Ordering::SeqCst), 1);
        assert_eq!(svc.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let svc = Tracked::default();
        svc.start().unwrap();
        svc.stop().unwrap();
        svc.start().unwrap();
        assert_eq!(svc.starts.load(Ordering::SeqCst), 2);
        assert_eq!(svc.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_transition_after_shutdown() {
        let svc = Tracked::default();
        svc.start().unwrap();
        svc.shutdown().unwrap();
        assert_eq!(svc.stops.load(Ordering::SeqCst), 1);
        let err = svc.start().unwrap_err();
        assert!(err.to_string().contains("cannot start"));
    }
}
