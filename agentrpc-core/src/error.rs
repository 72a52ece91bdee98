//! Agent protocol error codes and types.
//!
//! This module provides the core error types used across the framework:
//! - [`ErrorCode`]: Stable string codes carried in `error` envelopes
//! - [`AgentError`]: The framework error type

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Stable error codes carried in `error` envelopes.
///
/// The wire representation is the SCREAMING_SNAKE_CASE form of the variant
/// name (e.g. `EXECUTION_ERROR`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed framing or HTTP-level request problem.
    InvalidRequest,
    /// Envelope decoded but violates the contract.
    InvalidMessage,
    /// Named peer not registered (or not available).
    AgentNotFound,
    /// Method requested is unsupported by the bound agent.
    NotImplemented,
    /// The agent's `process` failed.
    ExecutionError,
    /// The agent's stream produced an error.
    StreamError,
    /// Cancellation observed (caller ctx or explicit).
    Cancelled,
    /// Client-side deadline expired awaiting a response.
    AgentTimeout,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionClosed,
    /// Unexpected failure within the framework itself.
    InternalError,
}

impl ErrorCode {
    /// Get the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::AgentTimeout => "AGENT_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Parse a code from its wire representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INVALID_REQUEST" => Some(ErrorCode::InvalidRequest),
            "INVALID_MESSAGE" => Some(ErrorCode::InvalidMessage),
            "AGENT_NOT_FOUND" => Some(ErrorCode::AgentNotFound),
            "NOT_IMPLEMENTED" => Some(ErrorCode::NotImplemented),
            "EXECUTION_ERROR" => Some(ErrorCode::ExecutionError),
            "STREAM_ERROR" => Some(ErrorCode::StreamError),
            "CANCELLED" => Some(ErrorCode::Cancelled),
            "AGENT_TIMEOUT" => Some(ErrorCode::AgentTimeout),
            "CONNECTION_FAILED" => Some(ErrorCode::ConnectionFailed),
            "CONNECTION_TIMEOUT" => Some(ErrorCode::ConnectionTimeout),
            "CONNECTION_CLOSED" => Some(ErrorCode::ConnectionClosed),
            "INTERNAL_ERROR" => Some(ErrorCode::InternalError),
            _ => None,
        }
    }

    /// HTTP status this code maps to when the server replies over HTTP.
    ///
    /// Codes that never appear in server responses (client-local transport
    /// and timeout codes) fall back to 500.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest | ErrorCode::InvalidMessage => StatusCode::BAD_REQUEST,
            ErrorCode::AgentNotFound => StatusCode::NOT_FOUND,
            ErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::ExecutionError
            | ErrorCode::InternalError
            | ErrorCode::StreamError
            | ErrorCode::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::AgentTimeout
            | ErrorCode::ConnectionFailed
            | ErrorCode::ConnectionTimeout
            | ErrorCode::ConnectionClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framework error variants.
///
/// `Status` carries an error reported through an `error` envelope (either
/// produced locally by an agent or received from a remote peer); the other
/// variants are transport- and codec-level failures that never cross the
/// wire as-is.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    /// An error with a protocol code, message, and optional details.
    #[error("{code}: {message}")]
    Status {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Map<String, serde_json::Value>>,
    },

    /// Transport-level fault (I/O error, refused connection, reset).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection establishment exceeded its deadline.
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    /// Orderly shutdown observed from the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Client-side deadline expired awaiting a response.
    #[error("agent '{agent}' timed out after {seconds}s")]
    Timeout { agent: String, seconds: u64 },

    /// Message encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Cancellation observed.
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    /// Create a new status error with a code and message.
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        AgentError::Status {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details to a status error.
    pub fn with_details(mut self, map: serde_json::Map<String, serde_json::Value>) -> Self {
        if let AgentError::Status { details, .. } = &mut self {
            *details = Some(map);
        }
        self
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Status { code, .. } => *code,
            AgentError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            AgentError::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            AgentError::ConnectionClosed => ErrorCode::ConnectionClosed,
            AgentError::Timeout { .. } => ErrorCode::AgentTimeout,
            AgentError::Encode(_) | AgentError::Decode(_) => ErrorCode::InvalidMessage,
            AgentError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Get the error message (without the code prefix).
    pub fn message(&self) -> String {
        match self {
            AgentError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Get the structured details, if any.
    pub fn details(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            AgentError::Status { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    // Convenience constructors

    /// Create an invalid request error.
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create an invalid message error.
    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::InvalidMessage, message)
    }

    /// Create an agent not found error.
    pub fn agent_not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::AgentNotFound, message)
    }

    /// Create a not implemented error.
    pub fn not_implemented<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    /// Create an execution error.
    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    /// Create a stream error.
    pub fn stream<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::StreamError, message)
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Whether this error represents an orderly connection shutdown rather
    /// than a fault.
    pub fn is_orderly_close(&self) -> bool {
        matches!(self, AgentError::ConnectionClosed)
            || matches!(
                self,
                AgentError::Status {
                    code: ErrorCode::ConnectionClosed,
                    ..
                }
            )
    }
}
