//! Envelope dispatch: the protocol semantics shared by every transport
//! binding.
//!
//! A [`Dispatcher`] owns the bound agent. Each binding decodes an incoming
//! envelope, hands it to [`Dispatcher::dispatch`], and frames whatever comes
//! back: either one reply envelope, or a lazy envelope stream ending in
//! exactly one terminator (`stream_end` or `error`).

use std::pin::Pin;
use std::sync::Arc;

use agentrpc_core::{
    Agent, AgentError, AgentStream, Envelope, EnvelopeType, ErrorCode, RequestMethod,
};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Correlation id used on error envelopes for frames that never yielded a
/// decodable envelope. A real id is always echoed when one is known.
pub const UNKNOWN_ID: &str = "unknown";

/// A lazily produced sequence of envelopes for one streaming request.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// The dispatcher's answer to one request envelope.
pub enum Reply {
    /// A single `response` or `error` envelope.
    Unary(Envelope),
    /// Zero or more `stream_chunk` envelopes followed by exactly one
    /// terminator.
    Stream(EnvelopeStream),
}

/// Binds one local agent and implements the request semantics.
pub struct Dispatcher {
    agent: Arc<dyn Agent>,
}

impl Dispatcher {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    /// The bound agent.
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Dispatch one decoded envelope.
    ///
    /// Every reply envelope echoes the request's id; the dispatcher never
    /// invents ids. Non-request envelopes and unknown methods come back as
    /// `error(INVALID_MESSAGE)`.
    pub async fn dispatch(&self, ctx: &CancellationToken, envelope: Envelope) -> Reply {
        if envelope.kind != EnvelopeType::Request {
            return Reply::Unary(Envelope::error(
                &envelope.id,
                ErrorCode::InvalidMessage,
                format!("expected request envelope, got {}", envelope.kind.as_str()),
            ));
        }

        let method = match envelope.request_method() {
            Ok(method) => method,
            Err(err) => return Reply::Unary(Envelope::from_error(&envelope.id, &err)),
        };
        let message = match envelope.payload_message() {
            Ok(message) => message,
            Err(err) => return Reply::Unary(Envelope::from_error(&envelope.id, &err)),
        };

        match method {
            RequestMethod::Process => {
                debug!(id = %envelope.id, agent = %self.agent.name(), "dispatching process");
                match self.agent.process(ctx, message).await {
                    Ok(reply) => match Envelope::response(&envelope.id, &reply) {
                        Ok(env) => Reply::Unary(env),
                        Err(err) => Reply::Unary(Envelope::from_error(&envelope.id, &err)),
                    },
                    Err(err) => Reply::Unary(process_failure(&envelope.id, err)),
                }
            }
            RequestMethod::Stream => {
                debug!(id = %envelope.id, agent = %self.agent.name(), "dispatching stream");
                match self.agent.stream(ctx, message).await {
                    Ok(stream) => {
                        Reply::Stream(run_stream(ctx.child_token(), envelope.id, stream))
                    }
                    Err(err) => Reply::Unary(stream_start_failure(&envelope.id, err)),
                }
            }
        }
    }
}

/// Map a failed `process` call onto an error envelope.
///
/// Any agent failure surfaces as `EXECUTION_ERROR` carrying the agent's
/// message and details; observed cancellation surfaces as `CANCELLED`.
fn process_failure(id: &str, err: AgentError) -> Envelope {
    match err {
        AgentError::Cancelled => Envelope::error(id, ErrorCode::Cancelled, "processing cancelled"),
        other => {
            let mut wrapped = AgentError::execution(other.message());
            if let Some(details) = other.details() {
                wrapped = wrapped.with_details(details.clone());
            }
            Envelope::from_error(id, &wrapped)
        }
    }
}

/// Map a failure to even start a stream onto an error envelope.
///
/// `NOT_IMPLEMENTED` (the non-streaming agent case) passes through; anything
/// else is a `STREAM_ERROR`.
fn stream_start_failure(id: &str, err: AgentError) -> Envelope {
    match err.code() {
        ErrorCode::NotImplemented | ErrorCode::Cancelled => Envelope::from_error(id, &err),
        _ => {
            let mut wrapped = AgentError::stream(err.message());
            if let Some(details) = err.details() {
                wrapped = wrapped.with_details(details.clone());
            }
            Envelope::from_error(id, &wrapped)
        }
    }
}

/// Drive an agent stream to envelopes.
///
/// Consumes the chunk and error sequences until both are exhausted. Chunks
/// become `stream_chunk` envelopes; clean exhaustion of both sequences
/// yields one `stream_end`; the first agent error yields one
/// `error(STREAM_ERROR)` and ends the stream; cancellation yields one
/// `error(CANCELLED)`.
fn run_stream(ctx: CancellationToken, id: String, mut stream: AgentStream) -> EnvelopeStream {
    Box::pin(async_stream::stream! {
        let mut chunks_open = true;
        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    yield Envelope::error(&id, ErrorCode::Cancelled, "stream cancelled");
                    return;
                }
                chunk = stream.chunks.recv(), if chunks_open => match chunk {
                    Some(message) => match Envelope::stream_chunk(&id, &message) {
                        Ok(env) => yield env,
                        Err(err) => {
                            warn!(id = %id, error = %err, "dropping unencodable chunk");
                            yield Envelope::error(&id, ErrorCode::StreamError, err.message());
                            return;
                        }
                    },
                    None => {
                        chunks_open = false;
                        if !errors_open {
                            yield Envelope::stream_end(&id);
                            return;
                        }
                    }
                },
                err = stream.errors.recv(), if errors_open => match err {
                    Some(err) => {
                        let mut wrapped = AgentError::stream(err.message());
                        if let Some(details) = err.details() {
                            wrapped = wrapped.with_details(details.clone());
                        }
                        yield Envelope::from_error(&id, &wrapped);
                        return;
                    }
                    None => {
                        errors_open = false;
                        if !chunks_open {
                            yield Envelope::stream_end(&id);
                            return;
                        }
                    }
                },
            }
        }
    })
}
