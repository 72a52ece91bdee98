//! The client proxy: a [`RemoteAgent`] behaves like a local agent whose
//! calls travel over a transport.

use std::sync::Arc;
use std::time::Duration;

use agentrpc_core::{
    Agent, AgentError, AgentStream, DEFAULT_STREAM_BUFFER, Endpoint, Envelope, EnvelopeType,
    Message, RequestMethod,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportOptions, connect_endpoint};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A local object whose calls are forwarded to a remote agent.
///
/// The proxy exclusively owns its transport. Calls on one proxy are
/// serialized: the wire is a single ordered channel with no per-call
/// multiplexing at this layer, so a second call cannot start before the
/// first has received its terminator.
pub struct RemoteAgent {
    name: String,
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    connect_timeout: Duration,
    stream_buffer: usize,
    /// Serializes calls; a streaming call holds it until the terminator.
    call_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RemoteAgent {
    /// Create a proxy for `name` reachable at `url`. The transport connects
    /// lazily on the first call.
    pub fn new<N: Into<String>>(name: N, url: &str) -> Result<Self, AgentError> {
        Self::with_options(name, url, TransportOptions::default())
    }

    /// [`new`](Self::new) with explicit transport options.
    pub fn with_options<N: Into<String>>(
        name: N,
        url: &str,
        options: TransportOptions,
    ) -> Result<Self, AgentError> {
        let endpoint = Endpoint::parse(url)?;
        let transport = connect_endpoint(&endpoint, options)?;
        Ok(Self {
            name: name.into(),
            endpoint,
            transport: Arc::from(transport),
            timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            call_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The remote endpoint this proxy targets.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the underlying transport currently looks connected.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Release the transport. Subsequent calls reconnect lazily.
    pub async fn close(&self) -> Result<(), AgentError> {
        self.transport.close().await
    }

    fn timeout_error(&self) -> AgentError {
        AgentError::Timeout {
            agent: self.name.clone(),
            seconds: self.timeout.as_secs(),
        }
    }

    async fn call_process(&self, message: &Message) -> Result<Message, AgentError> {
        let _guard = self.call_lock.lock().await;
        self.transport.connect(self.connect_timeout).await?;

        let request = Envelope::request(RequestMethod::Process, Some(&self.name), message)?;
        let id = request.id.clone();
        self.transport
            .send_framed(request.encode()?, self.timeout)
            .await?;

        loop {
            let bytes = self.transport.receive_framed(self.timeout).await?;
            let reply = Envelope::decode(&bytes)?;
            if reply.id != id {
                // Leftover of an abandoned earlier call on this connection.
                debug!(expected = %id, got = %reply.id, "skipping stale envelope");
                continue;
            }
            return match reply.kind {
                EnvelopeType::Response => reply.payload_message(),
                EnvelopeType::Error => Err(reply.to_agent_error()),
                other => Err(AgentError::invalid_message(format!(
                    "expected response or error envelope, got {}",
                    other.as_str()
                ))),
            };
        }
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process".to_string(), "stream".to_string()]
    }

    /// Single round-trip: exactly one `response` or `error` envelope.
    ///
    /// The effective deadline is the caller's cancellation combined with the
    /// proxy timeout; expiry surfaces as `AGENT_TIMEOUT` naming this proxy.
    async fn process(
        &self,
        ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.call_process(&message)) => {
                result.map_err(|_| self.timeout_error())?
            }
        }
    }

    /// Lazy streaming: envelopes are pumped into the returned chunk and
    /// error channels by a background task, which closes both on
    /// `stream_end`, on the first `error`, or when `ctx` fires.
    async fn stream(
        &self,
        ctx: &CancellationToken,
        message: Message,
    ) -> Result<AgentStream, AgentError> {
        let guard = Arc::clone(&self.call_lock).lock_owned().await;
        self.transport.connect(self.connect_timeout).await?;

        let request = Envelope::request(RequestMethod::Stream, Some(&self.name), &message)?;
        let id = request.id.clone();
        self.transport
            .send_framed(request.encode()?, self.timeout)
            .await?;

        let (tx, stream) = AgentStream::channel(self.stream_buffer);
        let transport = Arc::clone(&self.transport);
        let ctx = ctx.clone();
        let receive_timeout = self.timeout;
        tokio::spawn(async move {
            // Holding the call lock keeps later calls from interleaving with
            // this stream on the shared connection.
            let _guard = guard;
            loop {
                let bytes = tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!(id = %id, "stream cancelled by caller");
                        return;
                    }
                    received = transport.receive_framed(receive_timeout) => match received {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            let _ = tx.errors.send(err).await;
                            return;
                        }
                    }
                };
                let envelope = match Envelope::decode(&bytes) {
                    Ok(env) => env,
                    Err(err) => {
                        let _ = tx.errors.send(err).await;
                        return;
                    }
                };
                if envelope.id != id {
                    debug!(expected = %id, got = %envelope.id, "skipping stale envelope");
                    continue;
                }
                match envelope.kind {
                    EnvelopeType::StreamChunk => match envelope.payload_message() {
                        Ok(chunk) => {
                            if tx.chunks.send(chunk).await.is_err() {
                                // Consumer dropped the stream.
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.errors.send(err).await;
                            return;
                        }
                    },
                    EnvelopeType::StreamEnd => return,
                    EnvelopeType::Error => {
                        let _ = tx.errors.send(envelope.to_agent_error()).await;
                        return;
                    }
                    other => {
                        warn!(kind = other.as_str(), "unexpected envelope in stream");
                        let _ = tx
                            .errors
                            .send(AgentError::invalid_message(format!(
                                "unexpected {} envelope in stream",
                                other.as_str()
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }
}
