//! HTTP family adapter: HTTP/1.1, h2 over TLS (ALPN), and h2c, with SSE
//! streaming.
//!
//! `send_framed` inspects the request envelope's method: `process` becomes
//! one POST to `/process` whose response body is the reply envelope;
//! `stream` becomes one POST to `/stream` whose SSE events are pumped into
//! the receive queue by a background task. Either way `receive_framed` just
//! pops the queue, so the proxy sees the same framed contract as on a raw
//! socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentrpc_core::{AgentError, Envelope, ErrorCode, HttpScheme, RequestMethod};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sse::SseParser;
use super::tls::client_config;
use super::{ReceiveQueue, Transport, TransportOptions};

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP transport over hyper's legacy client.
pub struct HttpTransport {
    base_url: String,
    client: HyperClient,
    queue: Arc<ReceiveQueue>,
    /// The task driving the current logical request, superseded by the next
    /// `send_framed`.
    current: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    max_body: usize,
}

impl HttpTransport {
    pub fn new(
        scheme: HttpScheme,
        authority: String,
        options: TransportOptions,
    ) -> Result<Self, AgentError> {
        let base_url = match scheme {
            HttpScheme::Https => format!("https://{authority}"),
            // h2c is cleartext HTTP/2 by prior knowledge; the URL stays http.
            HttpScheme::Http | HttpScheme::H2c => format!("http://{authority}"),
            HttpScheme::H3 => {
                return Err(AgentError::invalid_request(
                    "h3 endpoints use the QUIC adapter",
                ));
            }
        };

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(client_config(options.danger_accept_invalid_certs))
            .https_or_http()
            .enable_all_versions()
            .build();
        let mut builder = Client::builder(TokioExecutor::new());
        if scheme == HttpScheme::H2c {
            builder.http2_only(true);
        }
        let client = builder.build(https);

        Ok(Self {
            base_url,
            client,
            queue: Arc::new(ReceiveQueue::new(options.queue_capacity)),
            current: Mutex::new(None),
            connected: AtomicBool::new(false),
            max_body: options.max_frame_len,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, _deadline: Duration) -> Result<(), AgentError> {
        // Connections live in hyper's pool, established per request.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_framed(&self, payload: Bytes, _deadline: Duration) -> Result<(), AgentError> {
        let envelope = Envelope::decode(&payload)?;
        let method = envelope.request_method()?;

        // A new logical request supersedes whatever the previous one left
        // behind (e.g. chunks of an abandoned stream).
        if let Some(task) = self.current.lock().await.take() {
            task.abort();
        }
        self.queue.clear();

        let client = self.client.clone();
        let queue = Arc::clone(&self.queue);
        let max_body = self.max_body;
        let id = envelope.id.clone();
        let task = match method {
            RequestMethod::Process => {
                let url = format!("{}/process", self.base_url);
                tokio::spawn(unary_call(client, url, id, payload, queue, max_body))
            }
            RequestMethod::Stream => {
                let url = format!("{}/stream", self.base_url);
                tokio::spawn(stream_call(client, url, id, payload, queue, max_body))
            }
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
        self.queue.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Error code a bare (non-envelope) HTTP status maps to.
pub(crate) fn status_error_code(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST => ErrorCode::InvalidRequest,
        StatusCode::NOT_FOUND => ErrorCode::AgentNotFound,
        StatusCode::NOT_IMPLEMENTED => ErrorCode::NotImplemented,
        _ => ErrorCode::InternalError,
    }
}

/// Queue a reply body: verbatim when it decodes as an envelope, otherwise
/// synthesized from the HTTP status.
pub(crate) async fn enqueue_reply(
    queue: &ReceiveQueue,
    id: &str,
    status: StatusCode,
    body: Bytes,
) {
    if Envelope::decode(&body).is_ok() {
        queue.push_bytes(body).await;
        return;
    }
    let envelope = Envelope::error(
        id,
        status_error_code(status),
        format!("http status {status} with non-envelope body"),
    );
    if let Err(err) = queue.push_envelope(&envelope).await {
        warn!(error = %err, "failed to queue synthesized error envelope");
    }
}

async fn unary_call(
    client: HyperClient,
    url: String,
    id: String,
    payload: Bytes,
    queue: Arc<ReceiveQueue>,
    max_body: usize,
) {
    let request = Request::post(url.as_str())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(payload));
    let request = match request {
        Ok(req) => req,
        Err(e) => {
            queue
                .push_fault(AgentError::ConnectionFailed(format!("bad request: {e}")))
                .await;
            return;
        }
    };

    let response = match client.request(request).await {
        Ok(resp) => resp,
        Err(e) => {
            queue
                .push_fault(AgentError::ConnectionFailed(format!("request failed: {e}")))
                .await;
            return;
        }
    };

    let status = response.status();
    let body = match collect_body(response.into_body(), max_body).await {
        Ok(body) => body,
        Err(err) => {
            queue.push_fault(err).await;
            return;
        }
    };
    debug!(%status, bytes = body.len(), "unary reply received");
    enqueue_reply(&queue, &id, status, body).await;
}

async fn stream_call(
    client: HyperClient,
    url: String,
    id: String,
    payload: Bytes,
    queue: Arc<ReceiveQueue>,
    max_body: usize,
) {
    let request = Request::post(url.as_str())
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .body(Full::new(payload));
    let request = match request {
        Ok(req) => req,
        Err(e) => {
            queue
                .push_fault(AgentError::ConnectionFailed(format!("bad request: {e}")))
                .await;
            return;
        }
    };

    let response = match client.request(request).await {
        Ok(resp) => resp,
        Err(e) => {
            queue
                .push_fault(AgentError::ConnectionFailed(format!("request failed: {e}")))
                .await;
            return;
        }
    };

    let status = response.status();
    if status != StatusCode::OK {
        // Stream start failed (e.g. 501): a single reply envelope.
        match collect_body(response.into_body(), max_body).await {
            Ok(body) => enqueue_reply(&queue, &id, status, body).await,
            Err(err) => queue.push_fault(err).await,
        }
        return;
    }

    let mut body = response.into_body();
    let mut parser = SseParser::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Some(data) = frame.data_ref() {
                    for event in parser.push(data) {
                        queue.push_bytes(event).await;
                    }
                }
            }
            Err(e) => {
                queue
                    .push_fault(AgentError::ConnectionFailed(format!("stream body failed: {e}")))
                    .await;
                return;
            }
        }
    }
    // Body closed. The proxy stops reading at the terminator envelope; this
    // fault is only observed when the server closed early.
    queue.push_fault(AgentError::ConnectionClosed).await;
}

async fn collect_body(body: hyper::body::Incoming, max_body: usize) -> Result<Bytes, AgentError> {
    let collected = body
        .collect()
        .await
        .map_err(|e| AgentError::ConnectionFailed(format!("body read failed: {e}")))?
        .to_bytes();
    if collected.len() > max_body {
        return Err(AgentError::invalid_message(format!(
            "response body of {} bytes exceeds the {} byte ceiling",
            collected.len(),
            max_body
        )));
    }
    Ok(collected)
}
