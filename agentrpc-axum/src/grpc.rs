//! gRPC binding (feature `tonic`).
//!
//! The service routes `/agentrpc.AgentService/Process` (unary) and
//! `/agentrpc.AgentService/Stream` (server-streaming) onto the shared
//! dispatcher, translating between the protobuf wire types in
//! [`agentrpc_core::proto`] and JSON envelopes. Protocol-level errors
//! (NOT_IMPLEMENTED, EXECUTION_ERROR, …) travel inside the response types,
//! not as gRPC statuses, so the error taxonomy is identical across
//! transports; `tonic::Status` is reserved for translation faults.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use agentrpc_core::proto::{self, ProcessRequest, ProcessResponse, StreamItem};
use agentrpc_core::{Agent, AgentError, ErrorCode, RequestMethod};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, Reply};

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;
type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn to_status(err: AgentError) -> tonic::Status {
    match err.code() {
        ErrorCode::InvalidMessage | ErrorCode::InvalidRequest => {
            tonic::Status::invalid_argument(err.to_string())
        }
        ErrorCode::NotImplemented => tonic::Status::unimplemented(err.to_string()),
        ErrorCode::Cancelled => tonic::Status::cancelled(err.to_string()),
        _ => tonic::Status::internal(err.to_string()),
    }
}

/// The tower service speaking the fixed `agentrpc.AgentService` schema.
#[derive(Clone)]
pub struct AgentServiceServer {
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
}

impl AgentServiceServer {
    pub fn new(dispatcher: Arc<Dispatcher>, ctx: CancellationToken) -> Self {
        Self { dispatcher, ctx }
    }
}

struct ProcessSvc(Arc<Dispatcher>, CancellationToken);

impl tonic::server::UnaryService<ProcessRequest> for ProcessSvc {
    type Response = ProcessResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<ProcessRequest>) -> Self::Future {
        let dispatcher = Arc::clone(&self.0);
        let ctx = self.1.clone();
        Box::pin(async move {
            let envelope =
                proto::request_into_envelope(request.into_inner(), RequestMethod::Process)
                    .map_err(to_status)?;
            match dispatcher.dispatch(&ctx, envelope).await {
                Reply::Unary(env) => {
                    let resp = proto::response_from_envelope(&env).map_err(to_status)?;
                    Ok(tonic::Response::new(resp))
                }
                Reply::Stream(_) => {
                    Err(tonic::Status::internal("unary dispatch produced a stream"))
                }
            }
        })
    }
}

struct StreamSvc(Arc<Dispatcher>, CancellationToken);

impl tonic::server::ServerStreamingService<ProcessRequest> for StreamSvc {
    type Response = StreamItem;
    type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamItem, tonic::Status>> + Send>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<ProcessRequest>) -> Self::Future {
        let dispatcher = Arc::clone(&self.0);
        let ctx = self.1.clone();
        Box::pin(async move {
            let envelope =
                proto::request_into_envelope(request.into_inner(), RequestMethod::Stream)
                    .map_err(to_status)?;
            let stream: Self::ResponseStream = match dispatcher.dispatch(&ctx, envelope).await {
                // Stream start failed (e.g. NOT_IMPLEMENTED): one error item.
                Reply::Unary(env) => {
                    let item = proto::stream_item_from_envelope(&env).map_err(to_status)?;
                    Box::pin(futures::stream::once(async move { Ok(item) }))
                }
                Reply::Stream(envelopes) => Box::pin(envelopes.filter_map(|env| async move {
                    match proto::stream_item_from_envelope(&env) {
                        Ok(item) => Some(Ok(item)),
                        Err(err) => {
                            warn!(error = %err, "dropping untranslatable envelope");
                            None
                        }
                    }
                })),
            };
            Ok(tonic::Response::new(stream))
        })
    }
}

impl<B> Service<http::Request<B>> for AgentServiceServer
where
    B: http_body::Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        let ctx = self.ctx.clone();
        match req.uri().path() {
            proto::PROCESS_PATH => Box::pin(async move {
                let method = ProcessSvc(dispatcher, ctx);
                let codec = tonic_prost::ProstCodec::default();
                let mut grpc = tonic::server::Grpc::new(codec);
                Ok(grpc.unary(method, req).await)
            }),
            proto::STREAM_PATH => Box::pin(async move {
                let method = StreamSvc(dispatcher, ctx);
                let codec = tonic_prost::ProstCodec::default();
                let mut grpc = tonic::server::Grpc::new(codec);
                Ok(grpc.server_streaming(method, req).await)
            }),
            _ => Box::pin(async move {
                Ok(http::Response::builder()
                    .status(200)
                    .header("grpc-status", "12")
                    .header("content-type", "application/grpc")
                    .body(tonic::body::Body::default())
                    .unwrap())
            }),
        }
    }
}

impl tonic::server::NamedService for AgentServiceServer {
    const NAME: &'static str = proto::SERVICE_NAME;
}

/// A server binding one agent to a gRPC listener.
pub struct GrpcServer {
    ctx: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl GrpcServer {
    /// Bind `authority` (`host:port`) and start serving.
    pub async fn bind(authority: &str, agent: Arc<dyn Agent>) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(authority).await.map_err(|e| {
            AgentError::ConnectionFailed(format!("bind {authority} failed: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::ConnectionFailed(format!("local_addr failed: {e}")))?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        let ctx = CancellationToken::new();
        let svc = AgentServiceServer::new(Arc::new(Dispatcher::new(agent)), ctx.clone());
        let shutdown = ctx.clone();
        let task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(svc)
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "grpc server error");
            }
        });

        info!(addr = %local_addr, "grpc server listening");
        Ok(Self {
            ctx,
            serve_task: Mutex::new(Some(task)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop serving and wait for the transport to drain. Idempotent.
    pub async fn stop(&self) {
        self.ctx.cancel();
        if let Some(task) = self.serve_task.lock().await.take() {
            let _ = task.await;
        }
    }
}
