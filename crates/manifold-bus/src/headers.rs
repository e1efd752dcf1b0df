//! Transport-neutral message headers.
//!
//! Values are primitives only; insertion order is not significant.

use std::collections::HashMap;

/// Correlation id of a request, echoed on its reply.
pub const CORRELATION_ID: &str = "CorrelationId";

/// Path replies to a request should be produced to.
pub const REPLY_TO: &str = "ReplyTo";

/// Declared wire name of the payload type.
pub const MESSAGE_TYPE: &str = "MessageType";

/// Absolute request expiry, epoch milliseconds.
pub const EXPIRES: &str = "Expires";

/// Name of the bus that produced the message.
pub const ORIGINATOR: &str = "Originator";

/// Human-readable failure message on a header-only error reply.
pub const ERROR_MESSAGE: &str = "Error";

/// Classification tag on a header-only error reply.
pub const ERROR_KIND: &str = "ErrorKind";

/// A primitive header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// UTF-8 string.
    Str(String),
    /// Signed integer (covers int and long).
    Int(i64),
    /// Boolean flag.
    Bool(bool),
}

impl HeaderValue {
    /// Borrows the string value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Header map attached to every envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: HashMap<String, HeaderValue>,
}

impl HeaderMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Looks up a header.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.get(key)
    }

    /// Looks up a string header.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(HeaderValue::as_str)
    }

    /// Looks up an integer header.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(HeaderValue::as_int)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_typed_lookups() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID, "abc-123");
        headers.insert(EXPIRES, 1_700_000_000_000_i64);
        headers.insert("Compressed", true);

        assert_eq!(headers.get_str(CORRELATION_ID), Some("abc-123"));
        assert_eq!(headers.get_int(EXPIRES), Some(1_700_000_000_000));
        assert_eq!(headers.get("Compressed").and_then(HeaderValue::as_bool), Some(true));
        assert_eq!(headers.get_str(EXPIRES), None);
        assert!(!headers.contains(REPLY_TO));
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGINATOR, "bus-a");
        headers.insert(ORIGINATOR, "bus-b");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_str(ORIGINATOR), Some("bus-b"));
    }
}
