//! Stream-socket adapters: Unix domain and TCP with length-prefixed
//! framing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentrpc_core::{AgentError, read_frame, write_frame};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Transport, TransportOptions};

enum Target {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Unix(path) => write!(f, "unix://{}", path.display()),
            Target::Tcp(host, port) => write!(f, "tcp://{host}:{port}"),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One framed bidirectional byte stream.
///
/// One writer at a time (the proxy's send serialization) and one reader at a
/// time (the proxy receive path or the stream pump task); the halves are
/// locked independently so a streaming receive does not block sends.
pub struct SocketTransport {
    target: Target,
    max_frame_len: usize,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    connected: AtomicBool,
}

impl SocketTransport {
    pub fn unix(path: PathBuf, options: TransportOptions) -> Self {
        Self::new(Target::Unix(path), options)
    }

    pub fn tcp(host: String, port: u16, options: TransportOptions) -> Self {
        Self::new(Target::Tcp(host, port), options)
    }

    fn new(target: Target, options: TransportOptions) -> Self {
        Self {
            target,
            max_frame_len: options.max_frame_len,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    async fn open(&self) -> Result<(BoxedReader, BoxedWriter), AgentError> {
        match &self.target {
            Target::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    AgentError::ConnectionFailed(format!(
                        "connect {} failed: {e}",
                        path.display()
                    ))
                })?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Target::Tcp(host, port) => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        AgentError::ConnectionFailed(format!("connect {host}:{port} failed: {e}"))
                    })?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&self, deadline: Duration) -> Result<(), AgentError> {
        if self.is_connected() {
            return Ok(());
        }
        let (r, w) = tokio::time::timeout(deadline, self.open())
            .await
            .map_err(|_| {
                AgentError::ConnectionTimeout(format!("connect {} timed out", self.target))
            })??;
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        self.connected.store(true, Ordering::SeqCst);
        debug!(target = %self.target, "socket transport connected");
        Ok(())
    }

    async fn send_framed(&self, payload: Bytes, deadline: Duration) -> Result<(), AgentError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AgentError::ConnectionFailed("transport not connected".into()))?;
        let result = tokio::time::timeout(deadline, write_frame(writer, &payload, self.max_frame_len))
            .await
            .map_err(|_| AgentError::ConnectionTimeout("send deadline exceeded".into()))?;
        if result.is_err() {
            self.mark_disconnected();
        }
        result
    }

    async fn receive_framed(&self, deadline: Duration) -> Result<Bytes, AgentError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| AgentError::ConnectionFailed("transport not connected".into()))?;
        let result = tokio::time::timeout(deadline, read_frame(reader, self.max_frame_len))
            .await
            .map_err(|_| AgentError::ConnectionTimeout("receive deadline exceeded".into()))?;
        if let Err(err) = &result {
            if err.code() != agentrpc_core::ErrorCode::InvalidMessage {
                self.mark_disconnected();
            }
        }
        result
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        self.mark_disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrpc_core::{DEFAULT_MAX_FRAME_LEN, ErrorCode};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn echo_frame_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    loop {
                        match read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await {
                            Ok(frame) => {
                                if write_frame(&mut stream, &frame, DEFAULT_MAX_FRAME_LEN)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_send_receive() {
        let addr = echo_frame_server().await;
        let transport = SocketTransport::tcp(
            addr.ip().to_string(),
            addr.port(),
            TransportOptions::default(),
        );

        let deadline = Duration::from_secs(5);
        transport.connect(deadline).await.unwrap();
        assert!(transport.is_connected());
        // Idempotent.
        transport.connect(deadline).await.unwrap();

        transport
            .send_framed(Bytes::from_static(b"ping"), deadline)
            .await
            .unwrap();
        let got = transport.receive_framed(deadline).await.unwrap();
        assert_eq!(&got[..], b"ping");

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and immediately drop to find a port with no listener.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport =
            SocketTransport::tcp("127.0.0.1".into(), port, TransportOptions::default());
        let err = transport.connect(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport =
            SocketTransport::tcp("127.0.0.1".into(), 1, TransportOptions::default());
        let err = transport
            .send_framed(Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_orderly_close_surfaces_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let transport = SocketTransport::tcp(
            addr.ip().to_string(),
            addr.port(),
            TransportOptions::default(),
        );
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let err = transport
            .receive_framed(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_orderly_close());
        assert!(!transport.is_connected());
    }
}
