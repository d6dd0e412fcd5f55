//! Shared routing decisions.

use sluice_core::Exchange;

/// Decides whether routing of `exchange` may continue to the next step.
///
/// Routing stops when the exchange failed, is marked for rollback, was
/// handled by an error handler, or was asked to stop. `context` describes
/// what stopping means to the caller and is only used for logging.
pub fn continue_processing(exchange: &Exchange, context: &str) -> bool {
    let stop = exchange.is_failed()
        || exchange.is_rollback_only()
        || exchange.is_rollback_only_last()
        || exchange.is_error_handled();
    if stop {
        tracing::debug!(
            exchange_id = exchange.exchange_id(),
            failure = ?exchange.exception().map(ToString::to_string),
            "message exchange has failed: {context}"
        );
        return false;
    }
    if exchange.is_route_stop() {
        tracing::debug!(
            exchange_id = exchange.exchange_id(),
            "exchange is marked to stop routing: {context}"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::Failure;

    #[test]
    fn test_continue_processing() {
        let mut exchange = Exchange::new("x");
        assert!(continue_processing(&exchange, "test"));

        exchange.set_route_stop(true);
        assert!(!continue_processing(&exchange, "test"));

        let mut failed = Exchange::new("x");
        failed.set_exception(Failure::msg("boom"));
        assert!(!continue_processing(&failed, "test"));

        let mut rollback = Exchange::new("x");
        rollback.set_rollback_only_last(true);
        assert!(!continue_processing(&rollback, "test"));
    }
}
