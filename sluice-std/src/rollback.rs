//! Marks an exchange for rollback.

use sluice_core::{AsyncCallback, AsyncProcessor, Exchange, RoutingError, Service};

/// What a [`Rollback`] does to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackMode {
    /// Marks the exchange rollback-only and fails it.
    #[default]
    Raise,
    /// Only marks the exchange rollback-only.
    MarkRollbackOnly,
    /// Only marks the innermost transaction for rollback.
    MarkRollbackOnlyLast,
}

/// Forces the current transaction to roll back.
#[derive(Debug, Clone, Default)]
pub struct Rollback {
    mode: RollbackMode,
    message: Option<String>,
}

impl Rollback {
    /// Fails the exchange with a rollback error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the exchange with a rollback error carrying `message`.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            mode: RollbackMode::Raise,
            message: Some(message.into()),
        }
    }

    /// Marks the exchange rollback-only without failing it.
    pub fn mark_rollback_only() -> Self {
        Self {
            mode: RollbackMode::MarkRollbackOnly,
            message: None,
        }
    }

    /// Marks only the innermost transaction for rollback.
    pub fn mark_rollback_only_last() -> Self {
        Self {
            mode: RollbackMode::MarkRollbackOnlyLast,
            message: None,
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> RollbackMode {
        self.mode
    }
}

impl Service for Rollback {}

impl AsyncProcessor for Rollback {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.mode == RollbackMode::MarkRollbackOnlyLast {
            exchange.set_rollback_only_last(true);
        } else {
            exchange.set_rollback_only(true);
        }
        if self.mode == RollbackMode::Raise {
            exchange.set_exception(RoutingError::Rollback(self.message.clone()));
        }
        callback.done(exchange, true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::await_manager::process_sync;

    #[test]
    fn test_raise_fails_exchange() {
        let ex = process_sync(&Rollback::with_message("bad order"), Exchange::new("x")).unwrap();
        assert!(ex.is_rollback_only());
        let failure = ex.exception().unwrap();
        assert_eq!(failure.to_string(), "bad order");
        assert!(matches!(
            failure.find::<RoutingError>(),
            Some(RoutingError::Rollback(Some(_)))
        ));
    }

    #[test]
    fn test_mark_only() {
        let ex = process_sync(&Rollback::mark_rollback_only(), Exchange::new("x")).unwrap();
        assert!(ex.is_rollback_only());
        assert!(!ex.is_failed());

        let ex = process_sync(&Rollback::mark_rollback_only_last(), Exchange::new("x")).unwrap();
        assert!(ex.is_rollback_only_last());
        assert!(!ex.is_rollback_only());
        assert!(!ex.is_failed());
    }
}
