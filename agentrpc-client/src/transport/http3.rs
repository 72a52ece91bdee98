//! HTTP/3 adapter: the HTTP family contract carried over QUIC.
//!
//! Same request mapping as [`super::http`] — `process` → POST `/process`,
//! `stream` → POST `/stream` with SSE-shaped events — with quinn as the
//! connection layer and h3 as the HTTP/3 state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentrpc_core::{AgentError, Envelope, RequestMethod};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use http::{Request, StatusCode, header};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::http::enqueue_reply;
use super::sse::SseParser;
use super::tls::client_config;
use super::{ReceiveQueue, Transport, TransportOptions};

type SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

struct H3State {
    endpoint: quinn::Endpoint,
    send_request: SendRequest,
    driver: JoinHandle<()>,
}

/// HTTP/3 transport over quinn + h3.
pub struct H3Transport {
    authority: String,
    options: TransportOptions,
    state: Mutex<Option<H3State>>,
    queue: Arc<ReceiveQueue>,
    current: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl H3Transport {
    pub fn new(authority: String, options: TransportOptions) -> Self {
        let queue = Arc::new(ReceiveQueue::new(options.queue_capacity));
        Self {
            authority,
            options,
            state: Mutex::new(None),
            queue,
            current: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    async fn open(&self) -> Result<H3State, AgentError> {
        let host = self
            .authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.authority.as_str())
            .to_string();
        let addr = tokio::net::lookup_host(&self.authority)
            .await
            .map_err(|e| {
                AgentError::ConnectionFailed(format!("cannot resolve {}: {e}", self.authority))
            })?
            .next()
            .ok_or_else(|| {
                AgentError::ConnectionFailed(format!("no address for {}", self.authority))
            })?;

        let mut tls = client_config(self.options.danger_accept_invalid_certs);
        tls.alpn_protocols = vec![b"h3".to_vec()];
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| AgentError::ConnectionFailed(format!("quic tls config rejected: {e}")))?;

        let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let mut endpoint = quinn::Endpoint::client(
            bind_addr
                .parse()
                .map_err(|e| AgentError::ConnectionFailed(format!("bad bind address: {e}")))?,
        )
        .map_err(|e| AgentError::ConnectionFailed(format!("quic endpoint failed: {e}")))?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connection = endpoint
            .connect(addr, &host)
            .map_err(|e| AgentError::ConnectionFailed(format!("quic connect failed: {e}")))?
            .await
            .map_err(|e| AgentError::ConnectionFailed(format!("quic handshake failed: {e}")))?;

        let (mut driver, send_request) =
            h3::client::new(h3_quinn::Connection::new(connection))
                .await
                .map_err(|e| AgentError::ConnectionFailed(format!("h3 setup failed: {e}")))?;
        let driver = tokio::spawn(async move {
            let e = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!(error = %e, "h3 connection driver ended");
        });

        Ok(H3State {
            endpoint,
            send_request,
            driver,
        })
    }
}

#[async_trait]
impl Transport for H3Transport {
    async fn connect(&self, deadline: Duration) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let opened = tokio::time::timeout(deadline, self.open())
            .await
            .map_err(|_| {
                AgentError::ConnectionTimeout(format!("connect h3://{} timed out", self.authority))
            })??;
        *state = Some(opened);
        self.connected.store(true, Ordering::SeqCst);
        debug!(authority = %self.authority, "h3 transport connected");
        Ok(())
    }

    async fn send_framed(&self, payload: Bytes, _deadline: Duration) -> Result<(), AgentError> {
        let envelope = Envelope::decode(&payload)?;
        let method = envelope.request_method()?;

        let send_request = {
            let state = self.state.lock().await;
            let state = state
                .as_ref()
                .ok_or_else(|| AgentError::ConnectionFailed("transport not connected".into()))?;
            state.send_request.clone()
        };

        if let Some(task) = self.current.lock().await.take() {
            task.abort();
        }
        self.queue.clear();

        let queue = Arc::clone(&self.queue);
        let authority = self.authority.clone();
        let id = envelope.id.clone();
        let max_body = self.options.max_frame_len;
        let task = match method {
            RequestMethod::Process => tokio::spawn(unary_call(
                send_request,
                authority,
                id,
                payload,
                queue,
                max_body,
            )),
            RequestMethod::Stream => tokio::spawn(stream_call(
                send_request,
                authority,
                id,
                payload,
                queue,
            )),
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
        if let Some(state) = self.state.lock().await.take() {
            state.endpoint.close(0u32.into(), b"client closed");
            state.driver.abort();
        }
        self.queue.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn fault(e: impl std::fmt::Display) -> AgentError {
    AgentError::ConnectionFailed(format!("h3 request failed: {e}"))
}

async fn unary_call(
    mut send_request: SendRequest,
    authority: String,
    id: String,
    payload: Bytes,
    queue: Arc<ReceiveQueue>,
    max_body: usize,
) {
    let result = async {
        let request = Request::post(format!("https://{authority}/process"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(())
            .map_err(fault)?;
        let mut stream = send_request.send_request(request).await.map_err(fault)?;
        stream.send_data(payload).await.map_err(fault)?;
        stream.finish().await.map_err(fault)?;

        let response = stream.recv_response().await.map_err(fault)?;
        let status = response.status();

        let mut body = BytesMut::new();
        while let Some(mut chunk) = stream.recv_data().await.map_err(fault)? {
            if body.len() + chunk.remaining() > max_body {
                return Err(AgentError::invalid_message(format!(
                    "response body exceeds the {max_body} byte ceiling"
                )));
            }
            let len = chunk.remaining();
            body.extend_from_slice(&chunk.copy_to_bytes(len));
        }
        Ok((status, body.freeze()))
    }
    .await;

    match result {
        Ok((status, body)) => enqueue_reply(&queue, &id, status, body).await,
        Err(err) => queue.push_fault(err).await,
    }
}

async fn stream_call(
    mut send_request: SendRequest,
    authority: String,
    id: String,
    payload: Bytes,
    queue: Arc<ReceiveQueue>,
) {
    let opened = async {
        let request = Request::post(format!("https://{authority}/stream"))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(())
            .map_err(fault)?;
        let mut stream = send_request.send_request(request).await.map_err(fault)?;
        stream.send_data(payload).await.map_err(fault)?;
        stream.finish().await.map_err(fault)?;
        let response = stream.recv_response().await.map_err(fault)?;
        Ok((response.status(), stream))
    }
    .await;

    let (status, mut stream) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            queue.push_fault(err).await;
            return;
        }
    };

    if status != StatusCode::OK {
        // Stream start failed: a single reply envelope.
        let mut body = BytesMut::new();
        loop {
            match stream.recv_data().await {
                Ok(Some(mut chunk)) => {
                    let len = chunk.remaining();
                    body.extend_from_slice(&chunk.copy_to_bytes(len));
                }
                Ok(None) => break,
                Err(e) => {
                    queue.push_fault(fault(e)).await;
                    return;
                }
            }
        }
        enqueue_reply(&queue, &id, status, body.freeze()).await;
        return;
    }

    let mut parser = SseParser::new();
    loop {
        match stream.recv_data().await {
            Ok(Some(mut chunk)) => {
                let len = chunk.remaining();
                let data = chunk.copy_to_bytes(len);
                for event in parser.push(&data) {
                    queue.push_bytes(event).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "h3 stream body failed");
                queue.push_fault(fault(e)).await;
                return;
            }
        }
    }
    queue.push_fault(AgentError::ConnectionClosed).await;
}
