//! HTTP/3 binding: the same `/process` and `/stream` routes served over
//! QUIC.
//!
//! QUIC mandates TLS, so binding takes a rustls server config; the ALPN
//! list is forced to `h3`. Stream responses reuse the SSE wire shape
//! (`data: <envelope>\n\n`) so the client's event parser is identical
//! across `http://` and `h3://`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agentrpc_core::{
    Agent, AgentError, DEFAULT_MAX_FRAME_LEN, Envelope, EnvelopeType, RequestMethod,
};
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use h3::quic::BidiStream;
use h3::server::RequestStream;
use http::{Method, Request, Response, StatusCode};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Reply, UNKNOWN_ID};
use crate::http::{health_document, live_document, ready_document};
use crate::socket::DEFAULT_SHUTDOWN_GRACE;

/// A server binding one agent to an HTTP/3 (QUIC) endpoint.
pub struct H3Server {
    endpoint: quinn::Endpoint,
    ctx: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl H3Server {
    /// Bind `addr` with the given TLS configuration and start serving.
    pub async fn bind(
        addr: std::net::SocketAddr,
        tls: rustls::ServerConfig,
        agent: Arc<dyn Agent>,
    ) -> Result<Self, AgentError> {
        Self::bind_with(addr, tls, agent, DEFAULT_MAX_FRAME_LEN, DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Bind with an explicit body ceiling and shutdown grace period.
    pub async fn bind_with(
        addr: std::net::SocketAddr,
        mut tls: rustls::ServerConfig,
        agent: Arc<dyn Agent>,
        max_body: usize,
        grace: Duration,
    ) -> Result<Self, AgentError> {
        tls.alpn_protocols = vec![b"h3".to_vec()];
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| AgentError::ConnectionFailed(format!("quic tls config rejected: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| AgentError::ConnectionFailed(format!("bind {addr} failed: {e}")))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| AgentError::ConnectionFailed(format!("local_addr failed: {e}")))?;

        let ctx = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(agent));
        let task = tokio::spawn(accept_loop(
            endpoint.clone(),
            dispatcher,
            ctx.clone(),
            max_body,
            grace,
        ));

        info!(addr = %local_addr, "h3 server listening");
        Ok(Self {
            endpoint,
            ctx,
            accept_task: Mutex::new(Some(task)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop serving: close the QUIC endpoint and wait for handlers.
    /// Idempotent.
    pub async fn stop(&self) {
        self.ctx.cancel();
        self.endpoint.close(0u32.into(), b"shutdown");
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        self.endpoint.wait_idle().await;
    }
}

async fn accept_loop(
    endpoint: quinn::Endpoint,
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    max_body: usize,
    grace: Duration,
) {
    let started_at = Instant::now();
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let dispatcher = Arc::clone(&dispatcher);
                let ctx = ctx.clone();
                connections.spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_connection(conn, dispatcher, ctx, started_at, max_body).await,
                        Err(e) => debug!(error = %e, "quic handshake failed"),
                    }
                });
            }
        }
    }

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("shutdown grace period elapsed, aborting h3 connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn handle_connection(
    conn: quinn::Connection,
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    started_at: Instant,
    max_body: usize,
) {
    let mut h3_conn = match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "h3 connection setup failed");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = h3_conn.accept() => match accepted {
                Ok(Some(resolver)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let (req, stream) = match resolver.resolve_request().await {
                            Ok(resolved) => resolved,
                            Err(e) => {
                                debug!(error = %e, "h3 request resolve failed");
                                return;
                            }
                        };
                        if let Err(e) =
                            handle_request(req, stream, dispatcher, ctx, started_at, max_body).await
                        {
                            debug!(error = %e, "h3 request failed");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "h3 accept error");
                    break;
                }
            }
        }
    }
}

async fn handle_request<S>(
    req: Request<()>,
    mut stream: RequestStream<S, Bytes>,
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    started_at: Instant,
    max_body: usize,
) -> Result<(), h3::error::StreamError>
where
    S: BidiStream<Bytes>,
{
    let path = req.uri().path().to_string();
    match (req.method(), path.as_str()) {
        (&Method::GET, "/health") | (&Method::HEAD, "/health") => {
            send_json(
                &mut stream,
                StatusCode::OK,
                &health_document(&dispatcher, started_at),
            )
            .await
        }
        (&Method::GET, "/live") | (&Method::HEAD, "/live") => {
            send_json(&mut stream, StatusCode::OK, &live_document()).await
        }
        (&Method::GET, "/ready") | (&Method::HEAD, "/ready") => {
            send_json(&mut stream, StatusCode::OK, &ready_document(&dispatcher)).await
        }
        (&Method::POST, "/process") => {
            let envelope = match read_envelope(&mut stream, max_body).await? {
                Ok(env) => env,
                Err(err) => return send_error(&mut stream, UNKNOWN_ID, &err).await,
            };
            if matches!(envelope.request_method(), Ok(RequestMethod::Stream)) {
                let err = AgentError::invalid_message("stream requests must use /stream");
                return send_error(&mut stream, &envelope.id, &err).await;
            }
            match dispatcher.dispatch(&ctx, envelope).await {
                Reply::Unary(env) => send_envelope(&mut stream, env).await,
                Reply::Stream(_) => {
                    let err = AgentError::internal("unary dispatch produced a stream");
                    send_error(&mut stream, UNKNOWN_ID, &err).await
                }
            }
        }
        (&Method::POST, "/stream") => {
            let envelope = match read_envelope(&mut stream, max_body).await? {
                Ok(env) => env,
                Err(err) => return send_error(&mut stream, UNKNOWN_ID, &err).await,
            };
            if matches!(envelope.request_method(), Ok(RequestMethod::Process)) {
                let err = AgentError::invalid_message("process requests must use /process");
                return send_error(&mut stream, &envelope.id, &err).await;
            }
            match dispatcher.dispatch(&ctx, envelope).await {
                Reply::Unary(env) => send_envelope(&mut stream, env).await,
                Reply::Stream(mut envelopes) => {
                    let resp = Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "text/event-stream")
                        .body(())
                        .expect("static response");
                    stream.send_response(resp).await?;
                    while let Some(env) = envelopes.next().await {
                        match serde_json::to_string(&env) {
                            Ok(json) => {
                                let event = format!("data: {json}\n\n");
                                stream.send_data(Bytes::from(event)).await?;
                            }
                            Err(err) => {
                                warn!(error = %err, "dropping unserializable envelope")
                            }
                        }
                    }
                    stream.finish().await
                }
            }
        }
        _ => {
            let err = AgentError::invalid_request(format!("no such route: {path}"));
            send_error(&mut stream, UNKNOWN_ID, &err).await
        }
    }
}

/// Collect the request body, enforcing the body ceiling.
async fn read_envelope<S>(
    stream: &mut RequestStream<S, Bytes>,
    max_body: usize,
) -> Result<Result<Envelope, AgentError>, h3::error::StreamError>
where
    S: BidiStream<Bytes>,
{
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        if body.len() + chunk.remaining() > max_body {
            return Ok(Err(AgentError::invalid_message(format!(
                "request body exceeds the {max_body} byte ceiling"
            ))));
        }
        let len = chunk.remaining();
        body.extend_from_slice(&chunk.copy_to_bytes(len));
    }
    Ok(Envelope::decode(&body))
}

async fn send_envelope<S>(
    stream: &mut RequestStream<S, Bytes>,
    envelope: Envelope,
) -> Result<(), h3::error::StreamError>
where
    S: BidiStream<Bytes>,
{
    let status = if envelope.kind == EnvelopeType::Error {
        envelope.to_agent_error().code().http_status()
    } else {
        StatusCode::OK
    };
    let body = envelope.encode().unwrap_or_else(|_| Bytes::from_static(b"{}"));
    let resp = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(())
        .expect("static response");
    stream.send_response(resp).await?;
    stream.send_data(body).await?;
    stream.finish().await
}

async fn send_error<S>(
    stream: &mut RequestStream<S, Bytes>,
    id: &str,
    err: &AgentError,
) -> Result<(), h3::error::StreamError>
where
    S: BidiStream<Bytes>,
{
    send_envelope(stream, Envelope::from_error(id, err)).await
}

async fn send_json<S>(
    stream: &mut RequestStream<S, Bytes>,
    status: StatusCode,
    doc: &serde_json::Value,
) -> Result<(), h3::error::StreamError>
where
    S: BidiStream<Bytes>,
{
    let body = serde_json::to_vec(doc).unwrap_or_default();
    let resp = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(())
        .expect("static response");
    stream.send_response(resp).await?;
    stream.send_data(Bytes::from(body)).await?;
    stream.finish().await
}
