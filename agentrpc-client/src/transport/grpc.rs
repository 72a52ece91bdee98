//! gRPC adapter: the envelope contract translated onto the fixed protobuf
//! schema.
//!
//! `send_framed` decodes the JSON request envelope, translates it to
//! [`agentrpc_core::proto`] types, and invokes the unary or
//! server-streaming RPC according to the request's method. Replies are
//! translated back to JSON envelopes and queued for `receive_framed`; the
//! queue is bounded, and on overflow only duplicate error envelopes are
//! dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentrpc_core::proto::{self, PROCESS_PATH, STREAM_PATH};
use agentrpc_core::{AgentError, Envelope, ErrorCode, RequestMethod};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{debug, warn};

use super::{ReceiveQueue, Transport, TransportOptions};

/// gRPC transport over a tonic channel.
pub struct GrpcTransport {
    host: String,
    port: u16,
    channel: Mutex<Option<Channel>>,
    queue: Arc<ReceiveQueue>,
    current: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl GrpcTransport {
    pub fn new(host: String, port: u16, options: TransportOptions) -> Self {
        Self {
            host,
            port,
            channel: Mutex::new(None),
            queue: Arc::new(ReceiveQueue::new(options.queue_capacity)),
            current: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn connect(&self, deadline: Duration) -> Result<(), AgentError> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }
        let url = format!("http://{}:{}", self.host, self.port);
        let endpoint = tonic::transport::Endpoint::from_shared(url.clone())
            .map_err(|e| AgentError::ConnectionFailed(format!("bad grpc endpoint {url}: {e}")))?
            .connect_timeout(deadline);
        let connected = tokio::time::timeout(deadline, endpoint.connect())
            .await
            .map_err(|_| AgentError::ConnectionTimeout(format!("connect {url} timed out")))?
            .map_err(|e| AgentError::ConnectionFailed(format!("connect {url} failed: {e}")))?;
        *channel = Some(connected);
        self.connected.store(true, Ordering::SeqCst);
        debug!(host = %self.host, port = self.port, "grpc transport connected");
        Ok(())
    }

    async fn send_framed(&self, payload: Bytes, _deadline: Duration) -> Result<(), AgentError> {
        let envelope = Envelope::decode(&payload)?;
        let method = envelope.request_method()?;
        let request = proto::request_from_envelope(&envelope)?;

        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| AgentError::ConnectionFailed("transport not connected".into()))?;

        if let Some(task) = self.current.lock().await.take() {
            task.abort();
        }
        self.queue.clear();

        let queue = Arc::clone(&self.queue);
        let id = envelope.id.clone();
        let task = match method {
            RequestMethod::Process => tokio::spawn(unary_call(channel, id, request, queue)),
            RequestMethod::Stream => tokio::spawn(stream_call(channel, id, request, queue)),
        };
        *self.current.lock().await = Some(task);
        Ok(())
    }

    async fn receive_framed(&self, deadline: Duration) -> Result<Bytes, AgentError> {
        tokio::time::timeout(deadline, self.queue.pop())
            .await
            .map_err(|_| AgentError::ConnectionTimeout("receive deadline exceeded".into()))?
    }

    async fn close(&self) -> Result<(), AgentError> {
        if let Some(task) = self.current.lock().await.take() {
            task.abort();
        }
        self.channel.lock().await.take();
        self.queue.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Map a gRPC status onto an error envelope, so transport-level statuses
/// surface through the same taxonomy as in-band errors.
fn status_envelope(id: &str, status: &tonic::Status) -> Envelope {
    let code = match status.code() {
        tonic::Code::Unimplemented => ErrorCode::NotImplemented,
        tonic::Code::InvalidArgument => ErrorCode::InvalidMessage,
        tonic::Code::Cancelled => ErrorCode::Cancelled,
        tonic::Code::DeadlineExceeded => ErrorCode::AgentTimeout,
        tonic::Code::NotFound => ErrorCode::AgentNotFound,
        _ => ErrorCode::InternalError,
    };
    Envelope::error(id, code, status.message())
}

async fn push_envelope(queue: &ReceiveQueue, envelope: &Envelope) {
    if let Err(err) = queue.push_envelope(envelope).await {
        warn!(error = %err, "failed to queue envelope");
    }
}

async fn unary_call(
    channel: Channel,
    id: String,
    request: proto::ProcessRequest,
    queue: Arc<ReceiveQueue>,
) {
    let mut grpc = tonic::client::Grpc::new(channel);
    if let Err(e) = grpc.ready().await {
        queue
            .push_fault(AgentError::ConnectionFailed(format!(
                "grpc channel not ready: {e}"
            )))
            .await;
        return;
    }

    let codec = tonic_prost::ProstCodec::default();
    let path = http::uri::PathAndQuery::from_static(PROCESS_PATH);
    match grpc
        .unary(tonic::Request::new(request), path, codec)
        .await
    {
        Ok(response) => match proto::response_into_envelope(response.into_inner()) {
            Ok(envelope) => push_envelope(&queue, &envelope).await,
            Err(err) => queue.push_fault(err).await,
        },
        Err(status) => push_envelope(&queue, &status_envelope(&id, &status)).await,
    }
}

async fn stream_call(
    channel: Channel,
    id: String,
    request: proto::ProcessRequest,
    queue: Arc<ReceiveQueue>,
) {
    let mut grpc = tonic::client::Grpc::new(channel);
    if let Err(e) = grpc.ready().await {
        queue
            .push_fault(AgentError::ConnectionFailed(format!(
                "grpc channel not ready: {e}"
            )))
            .await;
        return;
    }

    let codec = tonic_prost::ProstCodec::default();
    let path = http::uri::PathAndQuery::from_static(STREAM_PATH);
    let mut streaming = match grpc
        .server_streaming(tonic::Request::new(request), path, codec)
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            push_envelope(&queue, &status_envelope(&id, &status)).await;
            return;
        }
    };

    loop {
        match streaming.message().await {
            Ok(Some(item)) => match proto::stream_item_into_envelope(item) {
                Ok(envelope) => push_envelope(&queue, &envelope).await,
                Err(err) => {
                    warn!(error = %err, "dropping untranslatable stream item");
                }
            },
            Ok(None) => break,
            Err(status) => {
                push_envelope(&queue, &status_envelope(&id, &status)).await;
                return;
            }
        }
    }
    queue.push_fault(AgentError::ConnectionClosed).await;
}
