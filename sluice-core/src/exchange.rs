//! The exchange: the unit of work flowing through a route.
//!
//! An exchange carries an input message, an optional output message, a
//! failure, a typed property bag, and a set of routing flags. It is moved
//! by value into a processor and handed back through the processor's
//! callback, so exactly one thread of control owns it at any instant.

use crate::{
    error::Failure,
    message::Message,
    unit_of_work::{Synchronization, UnitOfWork},
    value::Value,
};
use bitflags::bitflags;
use std::{collections::HashMap, fmt, sync::Arc, time::Instant};

bitflags! {
    /// Routing state flags of an exchange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExchangeFlags: u8 {
        /// The exchange runs inside a transaction and must stay on one thread.
        const TRANSACTED = 1;
        /// Routing of this exchange should stop.
        const ROUTE_STOP = 1 << 1;
        /// The whole transaction must be rolled back.
        const ROLLBACK_ONLY = 1 << 2;
        /// Only the innermost transaction must be rolled back.
        const ROLLBACK_ONLY_LAST = 1 << 3;
        /// An error handler has handled the failure.
        const ERROR_HANDLED = 1 << 4;
        /// An error handler has exhausted its redelivery attempts.
        const REDELIVERY_EXHAUSTED = 1 << 5;
    }
}

/// How a throttled exchange obtained its permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThrottleEnqueue {
    /// Admitted on the calling thread.
    Sync,
    /// Queued on the throttler's async executor.
    Async,
    /// The async executor was saturated; ran on the calling thread instead.
    AsyncRejected,
}

/// The properties the routing core reads and writes.
///
/// Application specific properties live in [`ExchangeProperties::custom`].
#[derive(Debug, Clone, Default)]
pub struct ExchangeProperties {
    /// Correlation id shared by an exchange and its correlated copies.
    pub correlation_id: Option<String>,
    /// Index of a split branch.
    pub split_index: Option<usize>,
    /// Number of split branches, when known.
    pub split_size: Option<usize>,
    /// Whether this is the last split branch.
    pub split_complete: Option<bool>,
    /// Index of a multicast branch.
    pub multicast_index: Option<usize>,
    /// Whether this is the last multicast branch.
    pub multicast_complete: Option<bool>,
    /// Current loop iteration.
    pub loop_index: Option<usize>,
    /// Number of loop iterations, in counting mode.
    pub loop_size: Option<usize>,
    /// Whether the last evaluated filter matched.
    pub filter_matched: Option<bool>,
    /// The failure caught by a catch or finally clause.
    pub exception_caught: Option<Failure>,
    /// Set once a catch clause handled the failure.
    pub failure_handled: bool,
    /// The endpoint the exchange was last sent to.
    pub to_endpoint: Option<String>,
    /// The endpoint that was current when the exchange failed.
    pub failure_endpoint: Option<String>,
    /// How the throttler admitted the exchange.
    pub throttle_state: Option<ThrottleEnqueue>,
    /// When the exchange was queued by the throttler.
    pub throttle_queued_at: Option<Instant>,
    /// Marks an exchange that is running an on-completion body.
    pub on_completion: bool,
    /// Free-form properties.
    pub custom: HashMap<String, Value>,
}

impl ExchangeProperties {
    /// Copies every property that is set on `other` onto `self`.
    pub fn merge_from(&mut self, other: &ExchangeProperties) {
        macro_rules! merge {
            ($($field:ident),+) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )+
            };
        }
        merge!(
            correlation_id,
            split_index,
            split_size,
            split_complete,
            multicast_index,
            multicast_complete,
            loop_index,
            loop_size,
            filter_matched,
            exception_caught,
            to_endpoint,
            failure_endpoint,
            throttle_state,
            throttle_queued_at
        );
        self.failure_handled |= other.failure_handled;
        self.on_completion |= other.on_completion;
        self.custom
            .extend(other.custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Ties a pooled exchange to the factory that created it.
///
/// Leases are created by exchange factories only. Releasing an exchange
/// takes its lease back; dropping a leased exchange reports a discard.
pub trait ExchangeLease: Send + Sync + 'static {
    /// Identity of the owning factory.
    fn owner(&self) -> u64;

    /// Called when a leased exchange is dropped instead of released.
    fn discard(self: Box<Self>);
}

/// The unit of work flowing through the engine.
pub struct Exchange {
    id: String,
    input: Message,
    output: Option<Message>,
    exception: Option<Failure>,
    properties: ExchangeProperties,
    flags: ExchangeFlags,
    route_id: Option<String>,
    unit_of_work: Option<Arc<UnitOfWork>>,
    pending_completions: Vec<Arc<dyn Synchronization>>,
    lease: Option<Box<dyn ExchangeLease>>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Exchange {
    /// Creates an exchange whose input message has the given body.
    pub fn new(body: impl Into<Value>) -> Self {
        Self::from_message(Message::new(body))
    }

    /// Creates an exchange from an input message.
    pub fn from_message(input: Message) -> Self {
        Self {
            id: new_id(),
            input,
            output: None,
            exception: None,
            properties: ExchangeProperties::default(),
            flags: ExchangeFlags::empty(),
            route_id: None,
            unit_of_work: None,
            pending_completions: Vec::new(),
            lease: None,
        }
    }

    /// Builder-style header setter on the input message.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.set_header(name, value);
        self
    }

    /// Builder-style transacted marker.
    pub fn transacted(mut self) -> Self {
        self.set_transacted(true);
        self
    }

    /// The unique id of this exchange.
    pub fn exchange_id(&self) -> &str {
        &self.id
    }

    /// The correlation id: the explicit property, or this exchange's id.
    pub fn correlation_id(&self) -> &str {
        self.properties.correlation_id.as_deref().unwrap_or(&self.id)
    }

    /// The input message.
    pub fn input(&self) -> &Message {
        &self.input
    }

    /// Mutable access to the input message.
    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    /// Replaces the input message.
    pub fn set_input(&mut self, message: Message) {
        self.input = message;
    }

    /// Shortcut for the input body.
    pub fn body(&self) -> &Value {
        self.input.body()
    }

    /// Shortcut to replace the input body.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.input.set_body(body);
    }

    /// The output message, if one was produced.
    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    /// Returns true when an output message is present.
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Mutable access to the output message, creating it when missing.
    pub fn output_mut(&mut self) -> &mut Message {
        self.output.get_or_insert_with(Message::default)
    }

    /// Sets the output message.
    pub fn set_output(&mut self, message: Message) {
        self.output = Some(message);
    }

    /// Removes and returns the output message.
    pub fn take_output(&mut self) -> Option<Message> {
        self.output.take()
    }

    /// The message a downstream step would see: output if present, else input.
    pub fn message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    /// Promotes the output message (if any) to be the input message.
    pub fn prepare_out_to_in(&mut self) {
        if let Some(out) = self.output.take() {
            self.input = out;
        }
    }

    /// The failure, if any.
    pub fn exception(&self) -> Option<&Failure> {
        self.exception.as_ref()
    }

    /// Attaches a failure.
    pub fn set_exception(&mut self, failure: impl Into<Failure>) {
        self.exception = Some(failure.into());
    }

    /// Replaces the failure state.
    pub fn replace_exception(&mut self, failure: Option<Failure>) -> Option<Failure> {
        std::mem::replace(&mut self.exception, failure)
    }

    /// Removes and returns the failure.
    pub fn take_exception(&mut self) -> Option<Failure> {
        self.exception.take()
    }

    /// Returns true when a failure is attached.
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The typed properties.
    pub fn properties(&self) -> &ExchangeProperties {
        &self.properties
    }

    /// Mutable access to the typed properties.
    pub fn properties_mut(&mut self) -> &mut ExchangeProperties {
        &mut self.properties
    }

    /// Looks up a free-form property.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.custom.get(name)
    }

    /// Sets a free-form property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.custom.insert(name.into(), value.into());
    }

    /// The routing flags.
    pub fn flags(&self) -> ExchangeFlags {
        self.flags
    }

    /// Sets or clears a routing flag.
    pub fn set_flag(&mut self, flag: ExchangeFlags, value: bool) {
        self.flags.set(flag, value);
    }

    /// Returns true if the exchange is transacted.
    pub fn is_transacted(&self) -> bool {
        self.flags.contains(ExchangeFlags::TRANSACTED)
    }

    /// Marks the exchange as transacted.
    pub fn set_transacted(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::TRANSACTED, value);
    }

    /// Returns true if routing should stop.
    pub fn is_route_stop(&self) -> bool {
        self.flags.contains(ExchangeFlags::ROUTE_STOP)
    }

    /// Requests that routing stop.
    pub fn set_route_stop(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::ROUTE_STOP, value);
    }

    /// Returns true if the transaction must be rolled back.
    pub fn is_rollback_only(&self) -> bool {
        self.flags.contains(ExchangeFlags::ROLLBACK_ONLY)
    }

    /// Marks the transaction for rollback.
    pub fn set_rollback_only(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::ROLLBACK_ONLY, value);
    }

    /// Returns true if the innermost transaction must be rolled back.
    pub fn is_rollback_only_last(&self) -> bool {
        self.flags.contains(ExchangeFlags::ROLLBACK_ONLY_LAST)
    }

    /// Marks the innermost transaction for rollback.
    pub fn set_rollback_only_last(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::ROLLBACK_ONLY_LAST, value);
    }

    /// Returns true once an error handler has handled the failure.
    pub fn is_error_handled(&self) -> bool {
        self.flags.contains(ExchangeFlags::ERROR_HANDLED)
    }

    /// Records whether an error handler handled the failure.
    pub fn set_error_handled(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::ERROR_HANDLED, value);
    }

    /// Returns true once redelivery has been exhausted.
    pub fn is_redelivery_exhausted(&self) -> bool {
        self.flags.contains(ExchangeFlags::REDELIVERY_EXHAUSTED)
    }

    /// Records whether redelivery has been exhausted.
    pub fn set_redelivery_exhausted(&mut self, value: bool) {
        self.set_flag(ExchangeFlags::REDELIVERY_EXHAUSTED, value);
    }

    /// The id of the route currently processing this exchange.
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    /// Sets the current route id.
    pub fn set_route_id(&mut self, route_id: Option<String>) {
        self.route_id = route_id;
    }

    /// The unit of work, if one has been started.
    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    /// Attaches a unit of work, handing over any pending synchronizations.
    pub fn set_unit_of_work(&mut self, unit_of_work: Option<Arc<UnitOfWork>>) {
        if let Some(uow) = &unit_of_work {
            for sync in self.pending_completions.drain(..) {
                uow.add_synchronization(sync);
            }
        }
        self.unit_of_work = unit_of_work;
    }

    /// Detaches the unit of work.
    pub fn take_unit_of_work(&mut self) -> Option<Arc<UnitOfWork>> {
        self.unit_of_work.take()
    }

    /// Registers a completion hook for this exchange.
    ///
    /// The hook is added to the unit of work when one is attached, else it
    /// is kept on the exchange until a unit of work adopts it.
    pub fn add_on_completion(&mut self, sync: Arc<dyn Synchronization>) {
        match &self.unit_of_work {
            Some(uow) => uow.add_synchronization(sync),
            None => self.pending_completions.push(sync),
        }
    }

    /// Removes the completion hooks that are not yet owned by a unit of work.
    pub fn handover_completions(&mut self) -> Vec<Arc<dyn Synchronization>> {
        std::mem::take(&mut self.pending_completions)
    }

    /// Number of completion hooks waiting for a unit of work.
    pub fn pending_completions(&self) -> usize {
        self.pending_completions.len()
    }

    /// Creates a correlated copy: new id, the same correlation id,
    /// independent message and property state.
    pub fn correlated_copy(&self, share_unit_of_work: bool) -> Exchange {
        let mut copy = self.copy_state(new_id());
        copy.properties.correlation_id = Some(self.correlation_id().to_owned());
        if share_unit_of_work {
            copy.unit_of_work = self.unit_of_work.clone();
        }
        copy
    }

    /// Copies the results of `source` onto this exchange.
    ///
    /// Messages, failure, properties and routing flags are copied. The
    /// transacted flag of `self` is kept.
    pub fn copy_results_from(&mut self, source: &Exchange) {
        if std::ptr::eq(self, source) {
            return;
        }
        self.input = source.input.clone();
        if let Some(out) = &source.output {
            self.output = Some(out.clone());
        }
        self.exception = source.exception.clone();
        self.properties.merge_from(&source.properties);
        let transacted = self.is_transacted();
        self.flags = source.flags;
        self.set_transacted(transacted);
    }

    /// Clears all state so a pooled exchange can be reused.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output = None;
        self.exception = None;
        self.properties = ExchangeProperties::default();
        self.flags = ExchangeFlags::empty();
        self.route_id = None;
        self.unit_of_work = None;
        self.pending_completions.clear();
    }

    /// Re-initialises a reset exchange as a correlated copy of `parent`.
    pub fn reinit_from(&mut self, parent: &Exchange, share_unit_of_work: bool) {
        self.id = new_id();
        self.input = parent.input.clone();
        self.output = parent.output.clone();
        self.exception = parent.exception.clone();
        self.properties = parent.properties.clone();
        self.properties.correlation_id = Some(parent.correlation_id().to_owned());
        self.flags = parent.flags;
        self.route_id = parent.route_id.clone();
        self.unit_of_work = if share_unit_of_work {
            parent.unit_of_work.clone()
        } else {
            None
        };
    }

    /// Attaches a pool lease.
    pub fn set_lease(&mut self, lease: Box<dyn ExchangeLease>) {
        self.lease = Some(lease);
    }

    /// Removes the pool lease, if any.
    pub fn take_lease(&mut self) -> Option<Box<dyn ExchangeLease>> {
        self.lease.take()
    }

    /// The owner of this exchange's lease.
    pub fn lease_owner(&self) -> Option<u64> {
        self.lease.as_ref().map(|l| l.owner())
    }

    fn copy_state(&self, id: String) -> Exchange {
        Exchange {
            id,
            input: self.input.clone(),
            output: self.output.clone(),
            exception: self.exception.clone(),
            properties: self.properties.clone(),
            flags: self.flags,
            route_id: self.route_id.clone(),
            unit_of_work: None,
            pending_completions: Vec::new(),
            lease: None,
        }
    }
}

/// Cloning keeps the exchange id and unit of work; leases and pending
/// completion hooks stay with the original.
impl Clone for Exchange {
    fn clone(&self) -> Self {
        let mut copy = self.copy_state(self.id.clone());
        copy.unit_of_work = self.unit_of_work.clone();
        copy
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.discard();
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("exception", &self.exception)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Exchange::new(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlated_copy_shares_correlation_id() {
        let parent = Exchange::new("hello");
        let copy = parent.correlated_copy(false);
        assert_ne!(copy.exchange_id(), parent.exchange_id());
        assert_eq!(copy.correlation_id(), parent.correlation_id());

        let grandchild = copy.correlated_copy(false);
        assert_eq!(grandchild.correlation_id(), parent.exchange_id());
    }

    #[test]
    fn test_copy_is_independent() {
        let parent = Exchange::new("hello");
        let mut copy = parent.correlated_copy(false);
        copy.set_body("changed");
        copy.set_property("k", 1);
        assert_eq!(parent.body(), &Value::from("hello"));
        assert!(parent.property("k").is_none());
    }

    #[test]
    fn test_prepare_out_to_in() {
        let mut exchange = Exchange::new("in");
        exchange.output_mut().set_body("out");
        exchange.prepare_out_to_in();
        assert!(!exchange.has_output());
        assert_eq!(exchange.body(), &Value::from("out"));
    }

    #[test]
    fn test_copy_results_keeps_transacted() {
        let mut target = Exchange::new("a").transacted();
        let mut source = Exchange::new("b");
        source.set_route_stop(true);
        source.properties_mut().split_size = Some(3);
        target.copy_results_from(&source);
        assert!(target.is_transacted());
        assert!(target.is_route_stop());
        assert_eq!(target.body(), &Value::from("b"));
        assert_eq!(target.properties().split_size, Some(3));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut exchange = Exchange::new("x").transacted();
        exchange.set_exception(Failure::msg("boom"));
        exchange.set_property("k", "v");
        exchange.reset();
        assert!(exchange.body().is_null());
        assert!(!exchange.is_failed());
        assert!(exchange.flags().is_empty());
        assert!(exchange.property("k").is_none());
    }
}
