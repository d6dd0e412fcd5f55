//! The message carried by an exchange.

use crate::value::Value;
use std::collections::BTreeMap;

/// A message: a body and a set of named headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    body: Value,
    headers: BTreeMap<String, Value>,
}

impl Message {
    /// Creates a message with the given body and no headers.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    /// The body.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Mutable access to the body.
    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Takes the body, leaving [`Value::Null`].
    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    /// Looks up a header.
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Sets a header, returning the previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    /// Removes a header.
    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    /// All headers in name order.
    pub fn headers(&self) -> &BTreeMap<String, Value> {
        &self.headers
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Resets body and headers.
    pub fn clear(&mut self) {
        self.body = Value::Null;
        self.headers.clear();
    }
}
