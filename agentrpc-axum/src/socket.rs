//! Stream-socket server: Unix domain and TCP listeners speaking
//! length-prefixed envelopes.
//!
//! Per connection, one read loop runs `read frame → decode → dispatch →
//! write frame(s)`. Streaming requests run on their own task so the read
//! loop keeps serving the connection; every write goes through the
//! connection's write lock so frames stay atomic on the wire.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentrpc_core::{
    Agent, AgentError, DEFAULT_MAX_FRAME_LEN, Endpoint, Envelope, EnvelopeType, ErrorCode,
    read_frame, write_frame,
};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Reply, UNKNOWN_ID};

/// How long `stop` waits for in-flight handlers before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A server binding one agent to one Unix or TCP listener.
pub struct SocketServer {
    ctx: CancellationToken,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Socket file this server created; removed on orderly shutdown.
    unix_path: Option<PathBuf>,
    local_addr: Option<std::net::SocketAddr>,
    max_frame_len: usize,
}

impl SocketServer {
    /// Bind the endpoint and start accepting connections.
    pub async fn bind(endpoint: &Endpoint, agent: Arc<dyn Agent>) -> Result<Self, AgentError> {
        Self::bind_with(endpoint, agent, DEFAULT_MAX_FRAME_LEN, DEFAULT_SHUTDOWN_GRACE).await
    }

    /// Bind with an explicit frame ceiling and shutdown grace period.
    pub async fn bind_with(
        endpoint: &Endpoint,
        agent: Arc<dyn Agent>,
        max_frame_len: usize,
        grace: Duration,
    ) -> Result<Self, AgentError> {
        let (listener, unix_path, local_addr) = match endpoint {
            Endpoint::Unix { path } => {
                let listener = bind_unix(path)?;
                (Listener::Unix(listener), Some(path.clone()), None)
            }
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        AgentError::ConnectionFailed(format!("bind {host}:{port} failed: {e}"))
                    })?;
                let addr = listener.local_addr().map_err(|e| {
                    AgentError::ConnectionFailed(format!("local_addr failed: {e}"))
                })?;
                (Listener::Tcp(listener), None, Some(addr))
            }
            other => {
                return Err(AgentError::invalid_request(format!(
                    "socket server cannot bind {other}"
                )));
            }
        };

        let server = Self {
            ctx: CancellationToken::new(),
            running: AtomicBool::new(true),
            accept_task: Mutex::new(None),
            unix_path,
            local_addr,
            max_frame_len,
        };

        info!(endpoint = %endpoint, "socket server listening");
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(Dispatcher::new(agent)),
            server.ctx.clone(),
            max_frame_len,
            grace,
        ));
        *server.accept_task.lock().await = Some(task);
        Ok(server)
    }

    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// The socket file path, when listening on a Unix socket.
    pub fn unix_path(&self) -> Option<&PathBuf> {
        self.unix_path.as_ref()
    }

    /// The configured frame ceiling.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting, drain handlers for the grace period, then abort what
    /// is left, and remove a Unix socket file this server created.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.ctx.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(path) = &self.unix_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
        info!("socket server stopped");
    }
}

/// Bind a Unix listener with a 0700 parent directory and an 0600 socket
/// file.
fn bind_unix(path: &PathBuf) -> Result<UnixListener, AgentError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|e| {
                    AgentError::ConnectionFailed(format!(
                        "create socket dir {} failed: {e}",
                        dir.display()
                    ))
                })?;
        }
    }
    // A previous unclean shutdown may have left the file behind.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path).map_err(|e| {
        AgentError::ConnectionFailed(format!("bind {} failed: {e}", path.display()))
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        AgentError::ConnectionFailed(format!("chmod {} failed: {e}", path.display()))
    })?;
    Ok(listener)
}

async fn accept_loop(
    listener: Listener,
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    max_frame_len: usize,
    grace: Duration,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = accept_one(&listener) => match accepted {
                Ok(conn) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        match conn {
                            Accepted::Unix(stream) => {
                                handle_connection(stream, dispatcher, ctx, max_frame_len).await
                            }
                            Accepted::Tcp(stream) => {
                                handle_connection(stream, dispatcher, ctx, max_frame_len).await
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    // Cooperative drain, then hard abort after the grace period.
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("shutdown grace period elapsed, aborting connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

enum Accepted {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn accept_one(listener: &Listener) -> std::io::Result<Accepted> {
    match listener {
        Listener::Unix(l) => l.accept().await.map(|(s, _)| Accepted::Unix(s)),
        Listener::Tcp(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
    }
}

/// One `read frame → dispatch → write frame` loop.
///
/// Streaming requests run on their own task writing through the shared
/// write half; the loop ends on peer close, an unrecoverable frame, or
/// server shutdown.
async fn handle_connection<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
    ctx: CancellationToken,
    max_frame_len: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut streams = JoinSet::new();

    loop {
        let frame = tokio::select! {
            _ = ctx.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_len) => frame,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(err) if err.is_orderly_close() => {
                debug!("peer closed connection");
                break;
            }
            Err(err) if err.code() == ErrorCode::InvalidMessage => {
                // Oversize frame: the stream cannot be resynchronized.
                let _ = send_envelope(
                    &writer,
                    &Envelope::from_error(UNKNOWN_ID, &err),
                    max_frame_len,
                )
                .await;
                break;
            }
            Err(err) => {
                debug!(error = %err, "connection fault");
                break;
            }
        };

        let envelope = match Envelope::decode(&bytes) {
            Ok(env) => env,
            Err(err) => {
                let _ = send_envelope(
                    &writer,
                    &Envelope::from_error(UNKNOWN_ID, &err),
                    max_frame_len,
                )
                .await;
                break;
            }
        };

        if envelope.kind != EnvelopeType::Request {
            let env = Envelope::error(
                &envelope.id,
                ErrorCode::InvalidMessage,
                format!("expected request envelope, got {}", envelope.kind.as_str()),
            );
            if send_envelope(&writer, &env, max_frame_len).await.is_err() {
                break;
            }
            continue;
        }

        match dispatcher.dispatch(&ctx, envelope).await {
            Reply::Unary(env) => {
                if send_envelope(&writer, &env, max_frame_len).await.is_err() {
                    break;
                }
            }
            Reply::Stream(mut envelopes) => {
                let writer = Arc::clone(&writer);
                streams.spawn(async move {
                    while let Some(env) = envelopes.next().await {
                        if send_envelope(&writer, &env, max_frame_len).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }

    streams.shutdown().await;
}

async fn send_envelope<W>(
    writer: &Arc<Mutex<WriteHalf<W>>>,
    envelope: &Envelope,
    max_frame_len: usize,
) -> Result<(), AgentError>
where
    W: AsyncWrite,
{
    let bytes = envelope.encode()?;
    let mut guard = writer.lock().await;
    write_frame(&mut *guard, &bytes, max_frame_len).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrpc_core::{Message, RequestMethod};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

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

    async fn roundtrip(stream: &mut tokio::net::TcpStream, env: &Envelope) -> Envelope {
        let bytes = env.encode().unwrap();
        write_frame(stream, &bytes, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let reply = read_frame(stream, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        Envelope::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_process_round_trip() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = SocketServer::bind(&endpoint, Arc::new(EchoAgent)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = Envelope::request(RequestMethod::Process, None, &Message::user("Hello")).unwrap();
        let reply = roundtrip(&mut stream, &req).await;

        assert_eq!(reply.kind, EnvelopeType::Response);
        assert_eq!(reply.id, req.id);
        assert_eq!(
            reply.payload_message().unwrap().content_str(),
            Some("Echo: Hello")
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_frame_gets_error_then_close() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = SocketServer::bind(&endpoint, Arc::new(EchoAgent)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, b"not json", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();

        let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let env = Envelope::decode(&reply).unwrap();
        assert_eq!(env.to_agent_error().code(), ErrorCode::InvalidMessage);

        // The server then closes the connection.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_non_request_envelope_keeps_connection_open() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = SocketServer::bind(&endpoint, Arc::new(EchoAgent)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(&mut stream, &Envelope::stream_end("odd")).await;
        assert_eq!(reply.to_agent_error().code(), ErrorCode::InvalidMessage);
        assert_eq!(reply.id, "odd");

        // The connection survives; a valid request still works.
        let req = Envelope::request(RequestMethod::Process, None, &Message::user("x")).unwrap();
        let reply = roundtrip(&mut stream, &req).await;
        assert_eq!(reply.kind, EnvelopeType::Response);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unix_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let endpoint = Endpoint::Unix { path: path.clone() };

        let server = SocketServer::bind(&endpoint, Arc::new(EchoAgent)).await.unwrap();
        assert!(path.exists());

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let req = Envelope::request(RequestMethod::Process, None, &Message::user("Hello")).unwrap();
        let bytes = req.encode().unwrap();
        write_frame(&mut stream, &bytes, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let env = Envelope::decode(&reply).unwrap();
        assert_eq!(
            env.payload_message().unwrap().content_str(),
            Some("Echo: Hello")
        );

        server.stop().await;
        assert!(!path.exists());

        // Stop is idempotent.
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_concurrent_safe() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = Arc::new(
            SocketServer::bind(&endpoint, Arc::new(EchoAgent)).await.unwrap(),
        );

        let (a, b) = tokio::join!(server.stop(), server.stop());
        let _ = (a, b);
        server.stop().await;
        assert!(!server.is_running());
    }
}
