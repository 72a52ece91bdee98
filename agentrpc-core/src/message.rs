//! The message payload moved by the framework.
//!
//! Message semantics are opaque to the framework: `role` is a free-form
//! string, `content` any JSON value, and `metadata` a string-keyed map that
//! is round-tripped unchanged — except for the reserved [`TRACE_CONTEXT_KEY`]
//! used by tracing middleware.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved metadata key carrying a W3C-compatible trace propagation map.
///
/// The framework passes it through unchanged and never uses it for routing.
pub const TRACE_CONTEXT_KEY: &str = "trace_context";

/// The payload the framework moves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Free-form role, e.g. "user", "agent", "system".
    pub role: String,
    /// Free-form content; typically a string.
    pub content: Value,
    /// Caller metadata, round-tripped unchanged.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Set at construction.
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with an arbitrary role.
    pub fn new<R: Into<String>, C: Into<Value>>(role: R, content: C) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message with role "user".
    pub fn user<C: Into<Value>>(content: C) -> Self {
        Self::new("user", content)
    }

    /// Create a message with role "agent".
    pub fn agent<C: Into<Value>>(content: C) -> Self {
        Self::new("agent", content)
    }

    /// Create a message with role "system".
    pub fn system<C: Into<Value>>(content: C) -> Self {
        Self::new("system", content)
    }

    /// Attach a metadata entry.
    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The content as a string slice, when it is a JSON string.
    pub fn content_str(&self) -> Option<&str> {
        self.content.as_str()
    }

    /// The trace propagation map, when one is attached.
    pub fn trace_context(&self) -> Option<&Value> {
        self.metadata.get(TRACE_CONTEXT_KEY)
    }
}

/// RFC3339 serialization with nanosecond precision.
pub(crate) mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn to_string(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_string(dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_constructors() {
        assert_eq!(Message::user("hi").role, "user");
        assert_eq!(Message::agent("hi").role, "agent");
        assert_eq!(Message::system("hi").role, "system");
        assert_eq!(Message::new("tool", "hi").role, "tool");
    }

    #[test]
    fn test_serde_round_trip_preserves_metadata() {
        let msg = Message::user("Hello")
            .with_metadata("chunk_id", 3)
            .with_metadata("nested", serde_json::json!({"a": [1, 2, null]}));

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_timestamp_has_nanosecond_precision() {
        let msg = Message::user("x");
        let json = serde_json::to_value(&msg).unwrap();
        let ts = json["timestamp"].as_str().unwrap();
        // e.g. 2026-01-01T00:00:00.123456789Z
        let frac = ts.split('.').nth(1).expect("fractional seconds");
        assert_eq!(frac.len(), 9 + 1); // nine digits plus the trailing Z
    }

    #[test]
    fn test_structured_content() {
        let msg = Message::agent(serde_json::json!({"answer": 42}));
        assert!(msg.content_str().is_none());
        assert_eq!(msg.content["answer"], 42);
    }

    #[test]
    fn test_trace_context_accessor() {
        let msg = Message::user("x");
        assert!(msg.trace_context().is_none());

        let msg = msg.with_metadata(TRACE_CONTEXT_KEY, serde_json::json!({"traceparent": "00-aa-bb-01"}));
        assert!(msg.trace_context().is_some());
    }

    #[test]
    fn test_metadata_defaults_to_empty_when_absent() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":"hi","timestamp":"2026-01-02T03:04:05.000000001Z"}"#,
        )
        .unwrap();
        assert!(msg.metadata.is_empty());
    }
}
