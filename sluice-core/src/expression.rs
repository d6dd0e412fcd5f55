//! Expressions and predicates evaluated against an exchange.
//!
//! The engine does not ship an expression language; routes supply
//! implementations of these traits, usually closures.

use crate::{error::BoxError, exchange::Exchange, value::Value};
use std::sync::Arc;

/// Computes a value from an exchange.
pub trait Expression: Send + Sync + 'static {
    /// Evaluates the expression.
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, BoxError>;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, BoxError> {
        self(exchange)
    }
}

/// Tests a condition on an exchange.
pub trait Predicate: Send + Sync + 'static {
    /// Evaluates the predicate.
    fn matches(&self, exchange: &Exchange) -> Result<bool, BoxError>;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    fn matches(&self, exchange: &Exchange) -> Result<bool, BoxError> {
        self(exchange)
    }
}

/// A shared expression.
pub type SharedExpression = Arc<dyn Expression>;

/// A shared predicate.
pub type SharedPredicate = Arc<dyn Predicate>;

/// Builds an expression from an infallible closure.
pub fn expression<F>(f: F) -> SharedExpression
where
    F: Fn(&Exchange) -> Value + Send + Sync + 'static,
{
    Arc::new(move |ex: &Exchange| Ok::<_, BoxError>(f(ex)))
}

/// Builds an expression from a fallible closure.
pub fn try_expression<F>(f: F) -> SharedExpression
where
    F: Fn(&Exchange) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Builds a predicate from an infallible closure.
pub fn predicate<F>(f: F) -> SharedPredicate
where
    F: Fn(&Exchange) -> bool + Send + Sync + 'static,
{
    Arc::new(move |ex: &Exchange| Ok::<_, BoxError>(f(ex)))
}

/// Builds a predicate from a fallible closure.
pub fn try_predicate<F>(f: F) -> SharedPredicate
where
    F: Fn(&Exchange) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An expression that always yields `value`.
pub fn constant(value: impl Into<Value>) -> SharedExpression {
    let value = value.into();
    expression(move |_| value.clone())
}

/// An expression yielding the input body.
pub fn body() -> SharedExpression {
    expression(|ex| ex.body().clone())
}

/// An expression yielding an input header, or null.
pub fn header(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    expression(move |ex| ex.input().header(&name).cloned().unwrap_or_default())
}

/// A predicate comparing an input header to `value`.
pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> SharedPredicate {
    let name = name.into();
    let value = value.into();
    predicate(move |ex| ex.input().header(&name) == Some(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_expressions() {
        let ex = Exchange::new("body").with_header("h", 7);
        assert_eq!(body().evaluate(&ex).unwrap(), Value::from("body"));
        assert_eq!(header("h").evaluate(&ex).unwrap(), Value::Int(7));
        assert!(header("missing").evaluate(&ex).unwrap().is_null());
        assert_eq!(constant(3).evaluate(&ex).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_predicates() {
        let ex = Exchange::new("b").with_header("kind", "gold");
        assert!(header_equals("kind", "gold").matches(&ex).unwrap());
        assert!(!header_equals("kind", "silver").matches(&ex).unwrap());
        let failing = try_predicate(|_| Err("bad".into()));
        assert!(failing.matches(&ex).is_err());
    }
}
