//! The wire envelope and its JSON codec.
//!
//! Every unit delivered by a transport is one envelope:
//!
//! ```json
//! {"version": "1.0", "type": "...", "id": "...", "timestamp": "...", "payload": {...}}
//! ```
//!
//! The envelope is self-describing: a receiver can classify it without
//! out-of-band context. Decoding validates only the envelope itself;
//! per-method payload shape is checked by the dispatcher through the typed
//! accessors below.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AgentError, ErrorCode};
use crate::message::{Message, rfc3339};

/// Protocol version accepted on the wire.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Logical envelope kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Response,
    StreamChunk,
    StreamEnd,
    Error,
}

impl EnvelopeType {
    /// Get the wire representation of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Request => "request",
            EnvelopeType::Response => "response",
            EnvelopeType::StreamChunk => "stream_chunk",
            EnvelopeType::StreamEnd => "stream_end",
            EnvelopeType::Error => "error",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "request" => Some(EnvelopeType::Request),
            "response" => Some(EnvelopeType::Response),
            "stream_chunk" => Some(EnvelopeType::StreamChunk),
            "stream_end" => Some(EnvelopeType::StreamEnd),
            "error" => Some(EnvelopeType::Error),
            _ => None,
        }
    }
}

/// The logical verb inside a request envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMethod {
    Process,
    Stream,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Process => "process",
            RequestMethod::Stream => "stream",
        }
    }
}

/// The wire unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Correlation id, unique per logical request. Generated by the client,
    /// echoed by the server on every envelope of the same request.
    pub id: String,
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    fn with_payload(kind: EnvelopeType, id: String, payload: Map<String, Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build a `request` envelope with a fresh correlation id.
    pub fn request(
        method: RequestMethod,
        agent_name: Option<&str>,
        message: &Message,
    ) -> Result<Self, AgentError> {
        let mut payload = Map::new();
        payload.insert("method".into(), Value::String(method.as_str().into()));
        if let Some(name) = agent_name {
            payload.insert("agent_name".into(), Value::String(name.into()));
        }
        payload.insert("message".into(), message_value(message)?);
        Ok(Self::with_payload(
            EnvelopeType::Request,
            Uuid::new_v4().to_string(),
            payload,
        ))
    }

    /// Build a `response` envelope echoing the request id.
    pub fn response(id: &str, message: &Message) -> Result<Self, AgentError> {
        let mut payload = Map::new();
        payload.insert("message".into(), message_value(message)?);
        Ok(Self::with_payload(EnvelopeType::Response, id.into(), payload))
    }

    /// Build a `stream_chunk` envelope echoing the request id.
    pub fn stream_chunk(id: &str, message: &Message) -> Result<Self, AgentError> {
        let mut payload = Map::new();
        payload.insert("message".into(), message_value(message)?);
        Ok(Self::with_payload(
            EnvelopeType::StreamChunk,
            id.into(),
            payload,
        ))
    }

    /// Build a `stream_end` envelope echoing the request id.
    pub fn stream_end(id: &str) -> Self {
        Self::with_payload(EnvelopeType::StreamEnd, id.into(), Map::new())
    }

    /// Build an `error` envelope echoing the request id.
    pub fn error<S: AsRef<str>>(id: &str, code: ErrorCode, message: S) -> Self {
        let mut payload = Map::new();
        payload.insert("error_code".into(), Value::String(code.as_str().into()));
        payload.insert(
            "error_message".into(),
            Value::String(message.as_ref().into()),
        );
        Self::with_payload(EnvelopeType::Error, id.into(), payload)
    }

    /// Build an `error` envelope from an [`AgentError`], carrying its code,
    /// message, and details.
    pub fn from_error(id: &str, err: &AgentError) -> Self {
        let mut env = Self::error(id, err.code(), err.message());
        if let Some(details) = err.details() {
            env.payload
                .insert("error_details".into(), Value::Object(details.clone()));
        }
        env
    }

    /// Serialize to canonical JSON bytes.
    pub fn encode(&self) -> Result<Bytes, AgentError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| AgentError::Encode(format!("envelope encoding failed: {e}")))
    }

    /// Decode and validate an envelope from JSON bytes.
    ///
    /// Fails with `INVALID_MESSAGE` when the outer value is not a JSON
    /// object, `version` is missing or unknown, `type` is missing or not in
    /// the enumerated set, or `id` is missing.
    pub fn decode(bytes: &[u8]) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| AgentError::invalid_message(format!("envelope is not valid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| AgentError::invalid_message("envelope must be a JSON object"))?;

        let version = obj
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::invalid_message("envelope missing version"))?;
        if version != PROTOCOL_VERSION {
            return Err(AgentError::invalid_message(format!(
                "unsupported protocol version: {version}"
            )));
        }

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::invalid_message("envelope missing type"))?;
        let kind = EnvelopeType::from_wire(kind)
            .ok_or_else(|| AgentError::invalid_message(format!("unknown envelope type: {kind}")))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AgentError::invalid_message("envelope missing id"))?;

        let timestamp = match obj.get("timestamp").and_then(Value::as_str) {
            Some(ts) => rfc3339::parse(ts)
                .map_err(|e| AgentError::invalid_message(format!("bad envelope timestamp: {e}")))?,
            None => Utc::now(),
        };

        let payload = match obj.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(AgentError::invalid_message(
                    "envelope payload must be a JSON object",
                ));
            }
            None => Map::new(),
        };

        Ok(Self {
            version: version.to_string(),
            kind,
            id: id.to_string(),
            timestamp,
            payload,
        })
    }

    /// The `method` of a request envelope.
    pub fn request_method(&self) -> Result<RequestMethod, AgentError> {
        match self.payload.get("method").and_then(Value::as_str) {
            Some("process") => Ok(RequestMethod::Process),
            Some("stream") => Ok(RequestMethod::Stream),
            Some(other) => Err(AgentError::invalid_message(format!(
                "unknown request method: {other}"
            ))),
            None => Err(AgentError::invalid_message("request missing method")),
        }
    }

    /// The `agent_name` of a request envelope, when present.
    pub fn agent_name(&self) -> Option<&str> {
        self.payload.get("agent_name").and_then(Value::as_str)
    }

    /// The message carried by a request, response, or stream_chunk envelope.
    pub fn payload_message(&self) -> Result<Message, AgentError> {
        let value = self
            .payload
            .get("message")
            .ok_or_else(|| AgentError::invalid_message("envelope payload missing message"))?;
        serde_json::from_value(value.clone())
            .map_err(|e| AgentError::invalid_message(format!("malformed message payload: {e}")))
    }

    /// Decompose an error envelope into an [`AgentError::Status`].
    ///
    /// Unknown error codes degrade to `INTERNAL_ERROR` so that a newer peer
    /// never makes an older client unreadable.
    pub fn to_agent_error(&self) -> AgentError {
        let code = self
            .payload
            .get("error_code")
            .and_then(Value::as_str)
            .and_then(ErrorCode::from_str)
            .unwrap_or(ErrorCode::InternalError);
        let message = self
            .payload
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let details = match self.payload.get("error_details") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        AgentError::Status {
            code,
            message,
            details,
        }
    }
}

fn message_value(message: &Message) -> Result<Value, AgentError> {
    serde_json::to_value(message)
        .map_err(|e| AgentError::Encode(format!("message encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let msg = Message::user("Hello").with_metadata("k", "v");
        let env = Envelope::request(RequestMethod::Process, Some("echo"), &msg).unwrap();

        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();

        assert_eq!(back.kind, EnvelopeType::Request);
        assert_eq!(back.id, env.id);
        assert_eq!(back.request_method().unwrap(), RequestMethod::Process);
        assert_eq!(back.agent_name(), Some("echo"));
        assert_eq!(back.payload_message().unwrap(), msg);
    }

    #[test]
    fn test_response_echoes_id() {
        let msg = Message::agent("Echo: Hello");
        let env = Envelope::response("req-1", &msg).unwrap();
        assert_eq!(env.id, "req-1");
        assert_eq!(env.kind, EnvelopeType::Response);
        assert_eq!(env.payload_message().unwrap(), msg);
    }

    #[test]
    fn test_stream_end_has_empty_payload() {
        let env = Envelope::stream_end("req-2");
        assert_eq!(env.kind, EnvelopeType::StreamEnd);
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_error_envelope_round_trip() {
        let mut details = Map::new();
        details.insert("hint".into(), Value::String("retry later".into()));
        let err = AgentError::execution("intentional error").with_details(details.clone());

        let env = Envelope::from_error("req-3", &err);
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();

        match back.to_agent_error() {
            AgentError::Status {
                code,
                message,
                details: d,
            } => {
                assert_eq!(code, ErrorCode::ExecutionError);
                assert_eq!(message, "intentional error");
                assert_eq!(d, Some(details));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let err = Envelope::decode(b"[1,2,3]").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let raw = r#"{"version":"2.0","type":"request","id":"x","payload":{}}"#;
        let err = Envelope::decode(raw.as_bytes()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
        assert!(err.message().contains("2.0"));
    }

    #[test]
    fn test_decode_rejects_missing_or_unknown_type() {
        let raw = r#"{"version":"1.0","id":"x","payload":{}}"#;
        assert!(Envelope::decode(raw.as_bytes()).is_err());

        let raw = r#"{"version":"1.0","type":"heartbeat","id":"x","payload":{}}"#;
        assert!(Envelope::decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let raw = r#"{"version":"1.0","type":"stream_end","payload":{}}"#;
        assert!(Envelope::decode(raw.as_bytes()).is_err());

        let raw = r#"{"version":"1.0","type":"stream_end","id":"","payload":{}}"#;
        assert!(Envelope::decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_tolerates_missing_timestamp_and_payload() {
        let raw = r#"{"version":"1.0","type":"stream_end","id":"x"}"#;
        let env = Envelope::decode(raw.as_bytes()).unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_request_method_validation() {
        let msg = Message::user("x");
        let mut env = Envelope::request(RequestMethod::Stream, None, &msg).unwrap();
        assert_eq!(env.request_method().unwrap(), RequestMethod::Stream);

        env.payload
            .insert("method".into(), Value::String("subscribe".into()));
        assert!(env.request_method().is_err());

        env.payload.remove("method");
        assert!(env.request_method().is_err());
    }

    #[test]
    fn test_unknown_error_code_degrades_to_internal() {
        let raw = r#"{"version":"1.0","type":"error","id":"x","payload":{"error_code":"SOMETHING_NEW","error_message":"hm"}}"#;
        let env = Envelope::decode(raw.as_bytes()).unwrap();
        assert_eq!(env.to_agent_error().code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let msg = Message::user("x");
        let a = Envelope::request(RequestMethod::Process, None, &msg).unwrap();
        let b = Envelope::request(RequestMethod::Process, None, &msg).unwrap();
        assert_ne!(a.id, b.id);
    }
}
