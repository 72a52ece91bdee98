//! Protobuf wire types for the gRPC adapter.
//!
//! The gRPC wire carries a fixed schema equivalent to the JSON envelope's
//! (request, response, stream_chunk, stream_end, error) type set:
//!
//! ```proto
//! service AgentService {
//!   rpc Process(ProcessRequest) returns (ProcessResponse);
//!   rpc Stream(ProcessRequest) returns (stream StreamItem);
//! }
//! ```
//!
//! Message content and metadata stay JSON-encoded strings on the protobuf
//! wire so the adapter never constrains what the envelope can carry. The
//! translation functions below convert between envelopes and these types;
//! the request method never appears in the schema because it selects which
//! RPC is invoked.

use crate::envelope::{Envelope, EnvelopeType, RequestMethod};
use crate::error::{AgentError, ErrorCode};
use crate::message::{Message, rfc3339};

/// Fully-qualified gRPC service name.
pub const SERVICE_NAME: &str = "agentrpc.AgentService";

/// Path of the unary `Process` RPC.
pub const PROCESS_PATH: &str = "/agentrpc.AgentService/Process";

/// Path of the server-streaming `Stream` RPC.
pub const STREAM_PATH: &str = "/agentrpc.AgentService/Stream";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentMessage {
    #[prost(string, tag = "1")]
    pub role: ::prost::alloc::string::String,
    /// JSON-encoded content value.
    #[prost(string, tag = "2")]
    pub content_json: ::prost::alloc::string::String,
    /// JSON-encoded metadata object.
    #[prost(string, tag = "3")]
    pub metadata_json: ::prost::alloc::string::String,
    /// RFC3339 with nanoseconds.
    #[prost(string, tag = "4")]
    pub timestamp: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessRequest {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub agent_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub message: ::core::option::Option<AgentMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessResponse {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(oneof = "process_response::Outcome", tags = "2, 3")]
    pub outcome: ::core::option::Option<process_response::Outcome>,
}

pub mod process_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "2")]
        Message(super::AgentMessage),
        #[prost(message, tag = "3")]
        Error(super::WireError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamItem {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(oneof = "stream_item::Item", tags = "2, 3, 4")]
    pub item: ::core::option::Option<stream_item::Item>,
}

pub mod stream_item {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Item {
        #[prost(message, tag = "2")]
        Chunk(super::AgentMessage),
        #[prost(message, tag = "3")]
        End(super::StreamEnd),
        #[prost(message, tag = "4")]
        Error(super::WireError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamEnd {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireError {
    #[prost(string, tag = "1")]
    pub code: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    /// JSON-encoded details object; empty when absent.
    #[prost(string, tag = "3")]
    pub details_json: ::prost::alloc::string::String,
}

impl AgentMessage {
    /// Translate a framework message onto the protobuf wire.
    pub fn from_message(message: &Message) -> Result<Self, AgentError> {
        Ok(Self {
            role: message.role.clone(),
            content_json: serde_json::to_string(&message.content)
                .map_err(|e| AgentError::Encode(format!("content encoding failed: {e}")))?,
            metadata_json: serde_json::to_string(&message.metadata)
                .map_err(|e| AgentError::Encode(format!("metadata encoding failed: {e}")))?,
            timestamp: rfc3339::to_string(&message.timestamp),
        })
    }

    /// Translate back into a framework message.
    pub fn into_message(self) -> Result<Message, AgentError> {
        Ok(Message {
            role: self.role,
            content: serde_json::from_str(&self.content_json)
                .map_err(|e| AgentError::Decode(format!("malformed content: {e}")))?,
            metadata: serde_json::from_str(&self.metadata_json)
                .map_err(|e| AgentError::Decode(format!("malformed metadata: {e}")))?,
            timestamp: rfc3339::parse(&self.timestamp)
                .map_err(|e| AgentError::Decode(format!("malformed timestamp: {e}")))?,
        })
    }
}

impl WireError {
    pub fn from_agent_error(err: &AgentError) -> Self {
        Self {
            code: err.code().as_str().to_string(),
            message: err.message(),
            details_json: err
                .details()
                .and_then(|d| serde_json::to_string(d).ok())
                .unwrap_or_default(),
        }
    }

    pub fn into_agent_error(self) -> AgentError {
        let code = ErrorCode::from_str(&self.code).unwrap_or(ErrorCode::InternalError);
        let details = if self.details_json.is_empty() {
            None
        } else {
            serde_json::from_str(&self.details_json).ok()
        };
        AgentError::Status {
            code,
            message: self.message,
            details,
        }
    }
}

/// Build the protobuf request from a JSON request envelope.
pub fn request_from_envelope(env: &Envelope) -> Result<ProcessRequest, AgentError> {
    let message = env.payload_message()?;
    Ok(ProcessRequest {
        id: env.id.clone(),
        agent_name: env.agent_name().unwrap_or_default().to_string(),
        message: Some(AgentMessage::from_message(&message)?),
    })
}

/// Rebuild a JSON request envelope from the protobuf request.
///
/// The method is supplied by the RPC that carried the request; the id is
/// echoed, never re-generated.
pub fn request_into_envelope(
    req: ProcessRequest,
    method: RequestMethod,
) -> Result<Envelope, AgentError> {
    let message = req
        .message
        .ok_or_else(|| AgentError::invalid_message("request missing message"))?
        .into_message()?;
    let agent_name = if req.agent_name.is_empty() {
        None
    } else {
        Some(req.agent_name.as_str())
    };
    let mut env = Envelope::request(method, agent_name, &message)?;
    env.id = req.id;
    Ok(env)
}

/// Translate a dispatch reply envelope (`response` or `error`) into the
/// unary RPC response.
pub fn response_from_envelope(env: &Envelope) -> Result<ProcessResponse, AgentError> {
    let outcome = match env.kind {
        EnvelopeType::Response => {
            process_response::Outcome::Message(AgentMessage::from_message(&env.payload_message()?)?)
        }
        EnvelopeType::Error => {
            process_response::Outcome::Error(WireError::from_agent_error(&env.to_agent_error()))
        }
        other => {
            return Err(AgentError::invalid_message(format!(
                "cannot carry {} envelope on the unary RPC",
                other.as_str()
            )));
        }
    };
    Ok(ProcessResponse {
        id: env.id.clone(),
        outcome: Some(outcome),
    })
}

/// Translate the unary RPC response back into a JSON envelope.
pub fn response_into_envelope(resp: ProcessResponse) -> Result<Envelope, AgentError> {
    match resp.outcome {
        Some(process_response::Outcome::Message(msg)) => {
            Envelope::response(&resp.id, &msg.into_message()?)
        }
        Some(process_response::Outcome::Error(err)) => {
            Ok(Envelope::from_error(&resp.id, &err.into_agent_error()))
        }
        None => Err(AgentError::invalid_message("response missing outcome")),
    }
}

/// Translate a streaming envelope (`stream_chunk`, `stream_end`, `error`)
/// into a stream item.
pub fn stream_item_from_envelope(env: &Envelope) -> Result<StreamItem, AgentError> {
    let item = match env.kind {
        EnvelopeType::StreamChunk => {
            stream_item::Item::Chunk(AgentMessage::from_message(&env.payload_message()?)?)
        }
        EnvelopeType::StreamEnd => stream_item::Item::End(StreamEnd {}),
        EnvelopeType::Error => {
            stream_item::Item::Error(WireError::from_agent_error(&env.to_agent_error()))
        }
        other => {
            return Err(AgentError::invalid_message(format!(
                "cannot carry {} envelope on the streaming RPC",
                other.as_str()
            )));
        }
    };
    Ok(StreamItem {
        id: env.id.clone(),
        item: Some(item),
    })
}

/// Translate a stream item back into a JSON envelope.
pub fn stream_item_into_envelope(item: StreamItem) -> Result<Envelope, AgentError> {
    match item.item {
        Some(stream_item::Item::Chunk(msg)) => Envelope::stream_chunk(&item.id, &msg.into_message()?),
        Some(stream_item::Item::End(_)) => Ok(Envelope::stream_end(&item.id)),
        Some(stream_item::Item::Error(err)) => {
            Ok(Envelope::from_error(&item.id, &err.into_agent_error()))
        }
        None => Err(AgentError::invalid_message("stream item missing body")),
    }
}
