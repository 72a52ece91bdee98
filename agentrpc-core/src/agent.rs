//! The agent contract consumed by dispatchers, wrapped by middleware, and
//! extended by higher-level patterns.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::message::Message;

/// Buffer size for the chunk and error channels of a streaming response.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// The producer half of a streaming response.
///
/// The chunk and error sequences may terminate independently; dropping a
/// sender closes its sequence.
pub struct AgentStreamSender {
    pub chunks: mpsc::Sender<Message>,
    pub errors: mpsc::Sender<AgentError>,
}

/// A streaming response: a lazy chunk sequence and a lazy error sequence.
pub struct AgentStream {
    pub chunks: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<AgentError>,
}

impl AgentStream {
    /// Create a connected sender/receiver pair with the given buffer size.
    pub fn channel(buffer: usize) -> (AgentStreamSender, AgentStream) {
        let (chunk_tx, chunk_rx) = mpsc::channel(buffer.max(1));
        let (err_tx, err_rx) = mpsc::channel(buffer.max(1));
        (
            AgentStreamSender {
                chunks: chunk_tx,
                errors: err_tx,
            },
            AgentStream {
                chunks: chunk_rx,
                errors: err_rx,
            },
        )
    }
}

/// An agent turns an input message into one or more output messages.
///
/// `stream` is optional: the default implementation reports
/// `NOT_IMPLEMENTED`, which the dispatcher forwards to the caller verbatim.
/// Streaming agents override it (and typically advertise `"stream"` in
/// `capabilities`).
#[async_trait]
pub trait Agent: Send + Sync {
    /// The agent's name, used in registrations and error messages.
    fn name(&self) -> &str;

    /// Capability tags; semantics are opaque to the framework.
    fn capabilities(&self) -> Vec<String> {
        vec!["process".to_string()]
    }

    /// Handle one message, producing one reply.
    async fn process(
        &self,
        ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError>;

    /// Handle one message, producing a stream of chunks.
    async fn stream(
        &self,
        _ctx: &CancellationToken,
        _message: Message,
    ) -> Result<AgentStream, AgentError> {
        Err(AgentError::not_implemented(format!(
            "agent '{}' does not support streaming",
            self.name()
        )))
    }
}
