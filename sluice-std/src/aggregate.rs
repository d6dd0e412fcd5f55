//! Standard aggregation strategies.

use sluice_core::{AggregationStrategy, BoxError, Exchange, Value};

/// Keeps the most recent branch.
///
/// A failure of an earlier branch is carried over when the latest branch
/// succeeded, so a failure is never silently lost.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(
        &self,
        old: Option<Exchange>,
        mut new: Exchange,
        _input: &Exchange,
    ) -> Result<Exchange, BoxError> {
        if let Some(failure) = old.as_ref().and_then(Exchange::exception) {
            if !new.is_failed() {
                new.set_exception(failure.clone());
            }
        }
        Ok(new)
    }
}

/// Discards branch results and answers with the original exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseOriginal {
    propagate_exception: bool,
}

impl UseOriginal {
    /// A strategy ignoring branch results entirely.
    pub fn new() -> Self {
        Self::default()
    }

    /// A strategy that copies the first branch failure onto the original.
    pub fn propagating() -> Self {
        Self {
            propagate_exception: true,
        }
    }
}

impl AggregationStrategy for UseOriginal {
    fn aggregate(
        &self,
        old: Option<Exchange>,
        new: Exchange,
        input: &Exchange,
    ) -> Result<Exchange, BoxError> {
        let mut result = old.unwrap_or_else(|| input.clone());
        if self.propagate_exception && !result.is_failed() {
            if let Some(failure) = new.exception() {
                result.set_exception(failure.clone());
            }
        }
        Ok(result)
    }
}

/// Joins branch bodies as text.
#[derive(Debug, Clone)]
pub struct BodyConcat {
    delimiter: String,
}

impl BodyConcat {
    /// Joins with `delimiter` between bodies.
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl Default for BodyConcat {
    fn default() -> Self {
        Self::new("")
    }
}

impl AggregationStrategy for BodyConcat {
    fn aggregate(
        &self,
        old: Option<Exchange>,
        new: Exchange,
        _input: &Exchange,
    ) -> Result<Exchange, BoxError> {
        let Some(mut old) = old else {
            return Ok(new);
        };
        let body = format!("{}{}{}", old.body(), self.delimiter, new.body());
        old.set_body(body);
        if let Some(failure) = new.exception() {
            if !old.is_failed() {
                old.set_exception(failure.clone());
            }
        }
        old.properties_mut().merge_from(new.properties());
        Ok(old)
    }
}

/// Collects branch bodies into a list body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBody;

impl AggregationStrategy for GroupedBody {
    fn aggregate(
        &self,
        old: Option<Exchange>,
        mut new: Exchange,
        _input: &Exchange,
    ) -> Result<Exchange, BoxError> {
        let body = new.input_mut().take_body();
        let Some(mut old) = old else {
            new.set_body(vec![body]);
            return Ok(new);
        };
        let mut items = match old.input_mut().take_body() {
            Value::List(items) => items,
            other => vec![other],
        };
        items.push(body);
        old.set_body(items);
        old.properties_mut().merge_from(new.properties());
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::Failure;

    fn fold(strategy: &dyn AggregationStrategy, bodies: &[&str]) -> Exchange {
        let input = Exchange::new("in");
        let mut result = None;
        for body in bodies {
            result = Some(strategy.aggregate(result, Exchange::new(*body), &input).unwrap());
        }
        result.unwrap()
    }

    #[test]
    fn test_body_concat() {
        let ex = fold(&BodyConcat::new(","), &["a", "b", "c"]);
        assert_eq!(ex.body().to_text(), "a,b,c");
    }

    #[test]
    fn test_grouped_body() {
        let ex = fold(&GroupedBody, &["a", "b"]);
        assert_eq!(
            ex.body(),
            &Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_use_original_keeps_input() {
        let ex = fold(&UseOriginal::new(), &["a", "b"]);
        assert_eq!(ex.body().to_text(), "in");
    }

    #[test]
    fn test_use_latest_keeps_earlier_failure() {
        let input = Exchange::new("in");
        let mut failed = Exchange::new("a");
        failed.set_exception(Failure::msg("first"));
        let first = UseLatest.aggregate(None, failed, &input).unwrap();
        let ex = UseLatest.aggregate(Some(first), Exchange::new("b"), &input).unwrap();
        assert_eq!(ex.body().to_text(), "b");
        assert_eq!(ex.exception().map(ToString::to_string).as_deref(), Some("first"));
    }
}
