//! Message bodies, header values and expression results.

use crate::error::RoutingError;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// A dynamically typed value.
///
/// Used for message bodies, headers, custom exchange properties and the
/// results of expressions. The set of variants is closed on purpose: the
/// routing core only needs to tell text, numbers, lists and streams apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A list of values.
    List(Vec<Value>),
    /// A rewindable stream that may only be read once per copy.
    Stream(StreamCache),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrows the text if this is a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts to an integer where a lossless conversion exists.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Converts to a boolean where one is implied.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Borrows the elements if this is a [`Value::List`].
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Renders the value as text without consuming streams.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Stream(s) => write!(f, "StreamCache[{} bytes]", s.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<StreamCache> for Value {
    fn from(s: StreamCache) -> Self {
        Value::Stream(s)
    }
}

/// A cached stream body.
///
/// Clones share one read cursor, so a stream handed to two consumers is
/// still read only once. [`StreamCache::copy`] creates an independent
/// cursor over the same cached bytes; parallel fan-out gives every branch
/// but the first its own copy.
#[derive(Clone)]
pub struct StreamCache {
    data: Arc<[u8]>,
    position: Arc<Mutex<usize>>,
}

impl StreamCache {
    /// Caches the given bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            data: Arc::from(data),
            position: Arc::new(Mutex::new(0)),
        }
    }

    /// Total number of cached bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when no bytes are cached.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true once the shared cursor has reached the end.
    pub fn is_consumed(&self) -> bool {
        *self.position.lock() >= self.data.len() && !self.data.is_empty()
    }

    /// Reads the remaining bytes, advancing the shared cursor to the end.
    pub fn read_to_end(&self) -> Result<Vec<u8>, RoutingError> {
        let mut position = self.position.lock();
        if *position >= self.data.len() && !self.data.is_empty() {
            return Err(RoutingError::Stream("stream already consumed".into()));
        }
        let remaining = self.data[*position..].to_vec();
        *position = self.data.len();
        Ok(remaining)
    }

    /// Reads the remaining bytes as UTF-8 text.
    pub fn read_to_string(&self) -> Result<String, RoutingError> {
        let bytes = self.read_to_end()?;
        String::from_utf8(bytes).map_err(|e| RoutingError::Stream(e.to_string()))
    }

    /// Rewinds the shared cursor.
    pub fn reset(&self) {
        *self.position.lock() = 0;
    }

    /// Creates an independent copy positioned at the start.
    pub fn copy(&self) -> StreamCache {
        StreamCache {
            data: Arc::clone(&self.data),
            position: Arc::new(Mutex::new(0)),
        }
    }

    /// Returns true when both handles share the same cursor.
    pub fn shares_cursor_with(&self, other: &StreamCache) -> bool {
        Arc::ptr_eq(&self.position, &other.position)
    }
}

impl PartialEq for StreamCache {
    fn eq(&self, other: &Self) -> bool {
        self.shares_cursor_with(other)
    }
}

impl fmt::Debug for StreamCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCache")
            .field("len", &self.data.len())
            .field("position", &*self.position.lock())
            .finish()
    }
}
