//! HTTP binding for the dispatcher, built on axum.
//!
//! Routes:
//! - `GET /health`, `GET /live`, `GET /ready`: JSON status documents
//!   (`HEAD` permitted; other methods 405)
//! - `POST /process`: body = request envelope; response body = response or
//!   error envelope; status codes follow the error-code table
//! - `POST /stream`: Server-Sent Events, each `data:` field carrying one
//!   envelope
//!
//! The same listener serves HTTP/1.1 and cleartext HTTP/2 (h2c); hyper
//! negotiates by connection preface, so `http://` and `h2c://` clients land
//! on identical behavior.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentrpc_core::{
    Agent, AgentError, DEFAULT_MAX_FRAME_LEN, Envelope, EnvelopeType, PROTOCOL_VERSION,
    RequestMethod,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, Reply};
use crate::socket::DEFAULT_SHUTDOWN_GRACE;

/// SSE keep-alive comment interval.
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    started_at: Instant,
}

/// Build the axum router for an agent.
///
/// Exposed separately from [`HttpServer`] so the routes can be mounted into
/// an existing axum application.
pub fn router(dispatcher: Arc<Dispatcher>, ctx: CancellationToken) -> Router {
    router_with_limit(dispatcher, ctx, DEFAULT_MAX_FRAME_LEN)
}

/// [`router`] with an explicit request-body ceiling.
pub fn router_with_limit(
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    max_body: usize,
) -> Router {
    let state = AppState {
        dispatcher,
        ctx,
        started_at: Instant::now(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/process", post(process))
        .route("/stream", post(stream))
        .layer(RequestBodyLimitLayer::new(max_body))
        .with_state(state)
}

/// The `/health` status document, shared with the HTTP/3 binding.
pub(crate) fn health_document(dispatcher: &Dispatcher, started_at: Instant) -> serde_json::Value {
    let agent = dispatcher.agent();
    serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "uptime_seconds": started_at.elapsed().as_secs_f64(),
        "agent": agent.name(),
        "capabilities": agent.capabilities(),
    })
}

pub(crate) fn live_document() -> serde_json::Value {
    serde_json::json!({ "status": "alive" })
}

pub(crate) fn ready_document(dispatcher: &Dispatcher) -> serde_json::Value {
    serde_json::json!({
        "status": "ready",
        "agent": dispatcher.agent().name(),
    })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(health_document(&state.dispatcher, state.started_at))
}

async fn live() -> Json<serde_json::Value> {
    Json(live_document())
}

async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(ready_document(&state.dispatcher))
}

/// Map a reply envelope onto an HTTP response: error envelopes carry their
/// code's status, everything else is 200.
fn envelope_response(envelope: Envelope) -> Response {
    let status = if envelope.kind == EnvelopeType::Error {
        envelope.to_agent_error().code().http_status()
    } else {
        StatusCode::OK
    };
    (status, Json(envelope)).into_response()
}

fn error_response(id: &str, err: &AgentError) -> Response {
    envelope_response(Envelope::from_error(id, err))
}

async fn process(State(state): State<AppState>, body: Bytes) -> Response {
    let envelope = match Envelope::decode(&body) {
        Ok(env) => env,
        Err(err) => return error_response(crate::dispatcher::UNKNOWN_ID, &err),
    };
    // A streaming request on the unary route would have nowhere to put its
    // chunks.
    if matches!(envelope.request_method(), Ok(RequestMethod::Stream)) {
        return error_response(
            &envelope.id,
            &AgentError::invalid_message("stream requests must use /stream"),
        );
    }

    match state.dispatcher.dispatch(&state.ctx, envelope).await {
        Reply::Unary(env) => envelope_response(env),
        Reply::Stream(_) => error_response(
            crate::dispatcher::UNKNOWN_ID,
            &AgentError::internal("unary dispatch produced a stream"),
        ),
    }
}

async fn stream(State(state): State<AppState>, body: Bytes) -> Response {
    let envelope = match Envelope::decode(&body) {
        Ok(env) => env,
        Err(err) => return error_response(crate::dispatcher::UNKNOWN_ID, &err),
    };
    if matches!(envelope.request_method(), Ok(RequestMethod::Process)) {
        return error_response(
            &envelope.id,
            &AgentError::invalid_message("process requests must use /process"),
        );
    }

    match state.dispatcher.dispatch(&state.ctx, envelope).await {
        // Stream start failed (e.g. NOT_IMPLEMENTED): plain error response so
        // the status code carries the taxonomy mapping.
        Reply::Unary(env) => envelope_response(env),
        Reply::Stream(envelopes) => {
            let events = envelopes.filter_map(|env| async move {
                match serde_json::to_string(&env) {
                    Ok(json) => Some(Ok::<Event, Infallible>(Event::default().data(json))),
                    Err(err) => {
                        warn!(error = %err, "dropping unserializable envelope");
                        None
                    }
                }
            });
            Sse::new(events)
                .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
                .into_response()
        }
    }
}

/// A server binding one agent to an HTTP listener.
pub struct HttpServer {
    ctx: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl HttpServer {
    /// Bind `authority` (`host:port`) and start serving.
    pub async fn bind(authority: &str, agent: Arc<dyn Agent>) -> Result<Self, AgentError> {
        Self::bind_with(agent, authority, DEFAULT_MAX_FRAME_LEN, DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Bind with an explicit body ceiling and shutdown grace period.
    pub async fn bind_with(
        agent: Arc<dyn Agent>,
        authority: &str,
        max_body: usize,
        grace: Duration,
    ) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(authority).await.map_err(|e| {
            AgentError::ConnectionFailed(format!("bind {authority} failed: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::ConnectionFailed(format!("local_addr failed: {e}")))?;

        let ctx = CancellationToken::new();
        let app = router_with_limit(Arc::new(Dispatcher::new(agent)), ctx.clone(), max_body);

        let shutdown = ctx.clone();
        let hard_stop = ctx.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            tokio::select! {
                result = serve => {
                    if let Err(e) = result {
                        warn!(error = %e, "http server error");
                    }
                }
                _ = async {
                    hard_stop.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    warn!("shutdown grace period elapsed, dropping http connections");
                }
            }
        });

        info!(addr = %local_addr, "http server listening");
        Ok(Self {
            ctx,
            serve_task: Mutex::new(Some(task)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop serving and wait (bounded by the grace period). Idempotent.
    pub async fn stop(&self) {
        self.ctx.cancel();
        if let Some(task) = self.serve_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrpc_core::{ErrorCode, Message};
    use async_trait::async_trait;
    use tower::ServiceExt;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(
            &self,
            _ctx: &CancellationToken,
            message: Message,
        ) -> Result<Message, AgentError> {
            Ok(Message::agent(format!(
                "Echo: {}",
                message.content_str().unwrap_or_default()
            )))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(
            &self,
            _ctx: &CancellationToken,
            _message: Message,
        ) -> Result<Message, AgentError> {
            Err(AgentError::execution("intentional error"))
        }
    }

    fn test_router(agent: Arc<dyn Agent>) -> Router {
        router(Arc::new(Dispatcher::new(agent)), CancellationToken::new())
    }

    async fn post_envelope(app: Router, path: &str, env: &Envelope) -> (StatusCode, Envelope) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(env.encode().unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, Envelope::decode(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_document() {
        let app = test_router(Arc::new(EchoAgent));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["status"], "healthy");
        assert_eq!(doc["agent"], "echo");
        assert!(doc["uptime_seconds"].is_number());
    }

    #[tokio::test]
    async fn test_health_rejects_other_methods() {
        let app = test_router(Arc::new(EchoAgent));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_process_round_trip() {
        let app = test_router(Arc::new(EchoAgent));
        let req = Envelope::request(RequestMethod::Process, None, &Message::user("Hello")).unwrap();
        let (status, env) = post_envelope(app, "/process", &req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(env.kind, EnvelopeType::Response);
        assert_eq!(env.id, req.id);
        assert_eq!(
            env.payload_message().unwrap().content_str(),
            Some("Echo: Hello")
        );
    }

    #[tokio::test]
    async fn test_execution_error_maps_to_500() {
        let app = test_router(Arc::new(FailingAgent));
        let req = Envelope::request(RequestMethod::Process, None, &Message::user("x")).unwrap();
        let (status, env) = post_envelope(app, "/process", &req).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err = env.to_agent_error();
        assert_eq!(err.code(), ErrorCode::ExecutionError);
        assert!(err.message().contains("intentional error"));
    }

    #[tokio::test]
    async fn test_stream_on_non_streaming_agent_maps_to_501() {
        let app = test_router(Arc::new(EchoAgent));
        let req = Envelope::request(RequestMethod::Stream, None, &Message::user("x")).unwrap();
        let (status, env) = post_envelope(app, "/stream", &req).await;

        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(env.to_agent_error().code(), ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_400() {
        let app = test_router(Arc::new(EchoAgent));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/process")
            .body(axum::body::Body::from("not an envelope"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_method_route_mismatch_rejected() {
        let app = test_router(Arc::new(EchoAgent));
        let req = Envelope::request(RequestMethod::Stream, None, &Message::user("x")).unwrap();
        let (status, env) = post_envelope(app.clone(), "/process", &req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(env.to_agent_error().code(), ErrorCode::InvalidMessage);

        let req = Envelope::request(RequestMethod::Process, None, &Message::user("x")).unwrap();
        let (status, _) = post_envelope(app, "/stream", &req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
