//! Splitting a message into pieces processed as multicast branches.
//!
//! A [`SplitExpression`] turns the exchange into a single-pass sequence of
//! [`Value`]s. Each value becomes the body of a correlated copy sent to
//! the split processor. In streaming mode values are pulled one at a time
//! as branches are dispatched; otherwise they are all collected upfront and
//! the total is known to every branch.

use crate::{
    aggregate::UseOriginal,
    multicast::{
        BranchContext, BranchSource, MulticastBuilder, MulticastProcessor, Pairs,
        ProcessorExchangePair,
    },
};
use sluice_core::{
    BoxError, Exchange, RoutingError, Service, SharedAggregationStrategy, SharedExpression,
    SharedProcessor, Value,
};
use std::{fmt, sync::Arc};

type ItemIter = Box<dyn Iterator<Item = Result<Value, BoxError>> + Send>;

/// The pieces of a split.
pub struct SplitItems {
    iter: ItemIter,
    size: Option<usize>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SplitItems {
    /// Pieces known upfront.
    pub fn from_values(values: Vec<Value>) -> Self {
        let size = Some(values.len());
        Self {
            iter: Box::new(values.into_iter().map(Ok)),
            size,
            on_close: None,
        }
    }

    /// Pieces produced on demand, for example read from a stream.
    pub fn lazy<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            iter: Box::new(iter),
            size: None,
            on_close: None,
        }
    }

    /// Sets the hook releasing whatever backs the iterator.
    pub fn with_close(mut self, on_close: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }

    /// Number of pieces, when known upfront.
    pub fn size(&self) -> Option<usize> {
        self.size
    }
}

impl fmt::Debug for SplitItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitItems")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Splits an exchange into pieces.
pub trait SplitExpression: Send + Sync + 'static {
    /// Produces the pieces of `exchange`.
    fn split(&self, exchange: &Exchange) -> Result<SplitItems, BoxError>;
}

impl<F> SplitExpression for F
where
    F: Fn(&Exchange) -> Result<SplitItems, BoxError> + Send + Sync + 'static,
{
    fn split(&self, exchange: &Exchange) -> Result<SplitItems, BoxError> {
        self(exchange)
    }
}

/// Splits the body text on a delimiter, skipping empty tokens.
///
/// A list body is split into its elements and a null body into nothing.
#[derive(Debug, Clone)]
pub struct Tokenize {
    delimiter: String,
}

/// Splits the body on `delimiter`.
pub fn tokenize(delimiter: impl Into<String>) -> Tokenize {
    Tokenize {
        delimiter: delimiter.into(),
    }
}

impl Default for Tokenize {
    fn default() -> Self {
        tokenize(",")
    }
}

impl Tokenize {
    fn tokens(&self, text: &str) -> Vec<Value> {
        text.split(self.delimiter.as_str())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Value::from)
            .collect()
    }
}

impl SplitExpression for Tokenize {
    fn split(&self, exchange: &Exchange) -> Result<SplitItems, BoxError> {
        let values = match exchange.body() {
            Value::Null => Vec::new(),
            Value::List(items) => items.clone(),
            Value::Stream(stream) => {
                let text = stream.read_to_string()?;
                stream.reset();
                self.tokens(&text)
            }
            other => self.tokens(&other.to_text()),
        };
        Ok(SplitItems::from_values(values))
    }
}

/// Splits on the value of an expression: a list yields its elements, text
/// is tokenized on commas, null yields nothing and anything else is a
/// single piece.
#[derive(Clone)]
pub struct ExpressionSplit {
    expression: SharedExpression,
}

impl ExpressionSplit {
    /// Splits on the value of `expression`.
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

impl SplitExpression for ExpressionSplit {
    fn split(&self, exchange: &Exchange) -> Result<SplitItems, BoxError> {
        let value = self
            .expression
            .evaluate(exchange)
            .map_err(|e| RoutingError::Expression(e.to_string()))?;
        let values = match value {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            Value::Text(text) => Tokenize::default().tokens(&text),
            other => vec![other],
        };
        Ok(SplitItems::from_values(values))
    }
}

/// The branch source of a splitter.
pub struct SplitBranches {
    processor: SharedProcessor,
    expression: Arc<dyn SplitExpression>,
}

impl SplitBranches {
    /// Sends each piece produced by `expression` to `processor`.
    pub fn new(expression: impl SplitExpression, processor: SharedProcessor) -> Self {
        Self {
            processor,
            expression: Arc::new(expression),
        }
    }

    /// The processor receiving each piece.
    pub fn processor(&self) -> &SharedProcessor {
        &self.processor
    }
}

fn split_pair(
    context: &BranchContext,
    parent: &Exchange,
    processor: &SharedProcessor,
    index: usize,
    value: Value,
) -> Result<ProcessorExchangePair, BoxError> {
    let mut copy = context.copy(parent, index);
    copy.take_output();
    copy.set_body(value);
    context.pair(index, Arc::clone(processor), copy, true)
}

impl Service for SplitBranches {
    fn do_build(&self) -> Result<(), BoxError> {
        self.processor.build()
    }

    fn do_init(&self) -> Result<(), BoxError> {
        self.processor.init()
    }

    fn do_start(&self) -> Result<(), BoxError> {
        self.processor.start()
    }

    fn do_stop(&self) -> Result<(), BoxError> {
        self.processor.stop()
    }

    fn do_shutdown(&self) -> Result<(), BoxError> {
        self.processor.shutdown()
    }
}

impl BranchSource for SplitBranches {
    fn name(&self) -> &'static str {
        "splitter"
    }

    fn branches(&self, context: &BranchContext, exchange: &Exchange) -> Result<Pairs, BoxError> {
        let SplitItems {
            iter,
            size,
            on_close,
        } = self.expression.split(exchange)?;

        if context.is_streaming() {
            let context = context.clone();
            let parent = exchange.clone();
            let processor = Arc::clone(&self.processor);
            let pairs = iter.enumerate().map(move |(index, item)| {
                split_pair(&context, &parent, &processor, index, item?)
            });
            let pairs = Pairs::lazy(pairs, size);
            return Ok(match on_close {
                Some(on_close) => pairs.with_close(on_close),
                None => pairs,
            });
        }

        let values = iter.collect::<Result<Vec<_>, _>>();
        if let Some(on_close) = on_close {
            on_close();
        }
        let pairs = values?
            .into_iter()
            .enumerate()
            .map(|(index, value)| split_pair(context, exchange, &self.processor, index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pairs::from_vec(pairs))
    }

    fn update_branch(
        &self,
        exchange: &mut Exchange,
        index: usize,
        has_next: bool,
        size: Option<usize>,
    ) {
        let properties = exchange.properties_mut();
        properties.split_index = Some(index);
        properties.split_complete = Some(!has_next);
        match size {
            Some(size) => properties.split_size = Some(size),
            None if !has_next => properties.split_size = Some(index + 1),
            None => {}
        }
    }

    fn default_strategy(&self) -> Option<SharedAggregationStrategy> {
        Some(Arc::new(UseOriginal::new()))
    }
}

/// A splitter: multicast over pieces of one message.
pub type Splitter = MulticastProcessor<SplitBranches>;

impl MulticastProcessor<SplitBranches> {
    /// Starts building a splitter sending each piece to `processor`.
    pub fn splitter(
        expression: impl SplitExpression,
        processor: SharedProcessor,
    ) -> MulticastBuilder<SplitBranches> {
        MulticastBuilder::new(SplitBranches::new(expression, processor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregate::BodyConcat, await_manager::process_sync};
    use parking_lot::Mutex;
    use sluice_core::{constant, processor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (SharedProcessor, Arc<Mutex<Vec<(String, Option<usize>, Option<usize>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let p = processor(move |ex| {
            let props = ex.properties();
            s.lock()
                .push((ex.body().to_text(), props.split_index, props.split_size));
            Ok(())
        });
        (p, seen)
    }

    #[test]
    fn test_tokenize_skips_empty_tokens() {
        let items = tokenize(",").split(&Exchange::new("a,,b, c")).unwrap();
        assert_eq!(items.size(), Some(3));
    }

    #[test]
    fn test_split_upfront_sets_size_everywhere() {
        let (p, seen) = recorder();
        let splitter = Splitter::splitter(Tokenize::default(), p).build();
        let original = Exchange::new("a,b,c");
        let id = original.exchange_id().to_owned();
        let ex = process_sync(&splitter, original).unwrap();
        assert_eq!(ex.exchange_id(), id);
        assert_eq!(ex.body().to_text(), "a,b,c");
        assert_eq!(
            *seen.lock(),
            vec![
                ("a".to_owned(), Some(0), Some(3)),
                ("b".to_owned(), Some(1), Some(3)),
                ("c".to_owned(), Some(2), Some(3)),
            ]
        );
    }

    #[test]
    fn test_streaming_split_sets_size_on_last() {
        let (p, seen) = recorder();
        let lazy = |_: &Exchange| -> Result<SplitItems, BoxError> {
            Ok(SplitItems::lazy(
                ["x", "y"].into_iter().map(|s| Ok(Value::from(s))),
            ))
        };
        let splitter = Splitter::splitter(lazy, p)
            .streaming(true)
            .strategy(BodyConcat::new("+"))
            .build();
        let ex = process_sync(&splitter, Exchange::new("ignored")).unwrap();
        assert_eq!(ex.body().to_text(), "x+y");
        assert_eq!(
            *seen.lock(),
            vec![
                ("x".to_owned(), Some(0), None),
                ("y".to_owned(), Some(1), Some(2)),
            ]
        );
        assert_eq!(ex.properties().split_size, Some(2));
    }

    #[test]
    fn test_close_hook_runs_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let items = move |_: &Exchange| -> Result<SplitItems, BoxError> {
            let c = c.clone();
            Ok(SplitItems::lazy((0..3).map(|i| Ok(Value::from(i)))).with_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let splitter = Splitter::splitter(items, processor(|_| Ok(())))
            .streaming(true)
            .build();
        process_sync(&splitter, Exchange::new("x")).unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_split_failure_fails_original() {
        let failing = |_: &Exchange| -> Result<SplitItems, BoxError> { Err("unreadable".into()) };
        let splitter = Splitter::splitter(failing, processor(|_| Ok(()))).build();
        let ex = process_sync(&splitter, Exchange::new("x")).unwrap();
        assert_eq!(
            ex.exception().map(ToString::to_string).as_deref(),
            Some("unreadable")
        );
    }

    #[test]
    fn test_expression_split_over_list() {
        let list = constant(vec![Value::from(1), Value::from(2)]);
        let items = ExpressionSplit::new(list).split(&Exchange::new("x")).unwrap();
        assert_eq!(items.size(), Some(2));
    }
}
