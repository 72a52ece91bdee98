//! The uniform framed-message contract and per-wire adapters.
//!
//! Every adapter moves complete envelopes: `send_framed` delivers one
//! envelope to the peer, `receive_framed` returns the next one. How an
//! envelope crosses the wire — length prefix, HTTP body, SSE event,
//! WebSocket message, protobuf — is the adapter's business.

use std::collections::VecDeque;
use std::time::Duration;

use agentrpc_core::{
    AgentError, DEFAULT_MAX_FRAME_LEN, Endpoint, Envelope, EnvelopeType, ErrorCode, HttpScheme,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::backoff::BackoffPolicy;

pub mod grpc;
pub mod http;
pub mod http3;
pub mod socket;
pub mod sse;
pub(crate) mod tls;
pub mod ws;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;
pub use http3::H3Transport;
pub use socket::SocketTransport;
pub use ws::WsTransport;

/// The capability set every adapter implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the peer connection. Idempotent when already connected.
    ///
    /// Fails with `CONNECTION_FAILED` or `CONNECTION_TIMEOUT`.
    async fn connect(&self, deadline: Duration) -> Result<(), AgentError>;

    /// Deliver one complete envelope. Per-frame atomicity is guaranteed to
    /// the receiver.
    async fn send_framed(&self, payload: Bytes, deadline: Duration) -> Result<(), AgentError>;

    /// Return the next complete envelope's bytes.
    ///
    /// Fails with `CONNECTION_CLOSED` on orderly shutdown and
    /// `CONNECTION_FAILED` on an I/O fault.
    async fn receive_framed(&self, deadline: Duration) -> Result<Bytes, AgentError>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), AgentError>;

    /// Best-effort liveness indicator.
    fn is_connected(&self) -> bool;
}

/// Adapter configuration shared across wires.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Ceiling on one envelope (stream-socket frames and HTTP bodies).
    pub max_frame_len: usize,
    /// WebSocket PING cadence.
    pub keepalive_interval: Duration,
    /// The connection counts as broken when no traffic (PONG included) is
    /// seen for this long after a PING.
    pub keepalive_timeout: Duration,
    /// Reconnect backoff for the WebSocket adapter.
    pub reconnect: BackoffPolicy,
    /// Capacity of the receive queue on request/response wires (HTTP, gRPC,
    /// HTTP/3).
    pub queue_capacity: usize,
    /// Skip TLS certificate verification. For tests only.
    pub danger_accept_invalid_certs: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(30),
            reconnect: BackoffPolicy::default(),
            queue_capacity: 64,
            danger_accept_invalid_certs: false,
        }
    }
}

/// Wire a parsed endpoint to its transport adapter.
pub fn connect_endpoint(
    endpoint: &Endpoint,
    options: TransportOptions,
) -> Result<Box<dyn Transport>, AgentError> {
    match endpoint {
        Endpoint::Unix { path } => Ok(Box::new(SocketTransport::unix(path.clone(), options))),
        Endpoint::Tcp { host, port } => {
            Ok(Box::new(SocketTransport::tcp(host.clone(), *port, options)))
        }
        Endpoint::Http {
            scheme: HttpScheme::H3,
            authority,
        } => Ok(Box::new(H3Transport::new(authority.clone(), options))),
        Endpoint::Http { scheme, authority } => Ok(Box::new(HttpTransport::new(
            *scheme,
            authority.clone(),
            options,
        )?)),
        Endpoint::Ws { tls, authority } => {
            Ok(Box::new(WsTransport::new(*tls, authority.clone(), options)))
        }
        Endpoint::Grpc { host, port } => {
            Ok(Box::new(GrpcTransport::new(host.clone(), *port, options)))
        }
    }
}

/// An item waiting on a request/response adapter's receive queue.
pub(crate) enum QueueItem {
    Envelope {
        bytes: Bytes,
        /// Set for error envelopes: used for the duplicate-drop rule.
        error_key: Option<(String, ErrorCode)>,
    },
    Fault(AgentError),
}

/// The single logical receive queue of a request/response adapter.
///
/// Bounded. Pushing a regular envelope waits for space (backpressure onto
/// the wire); pushing an error envelope into a full queue drops it only when
/// an identical error (same id and code) is already queued.
pub(crate) struct ReceiveQueue {
    items: std::sync::Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl ReceiveQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: std::sync::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Queue one envelope, already encoded.
    pub(crate) async fn push_envelope(&self, envelope: &Envelope) -> Result<(), AgentError> {
        let error_key = (envelope.kind == EnvelopeType::Error)
            .then(|| (envelope.id.clone(), envelope.to_agent_error().code()));
        let bytes = envelope.encode()?;
        self.push(QueueItem::Envelope { bytes, error_key }).await;
        Ok(())
    }

    /// Queue raw envelope bytes (a body received verbatim from the wire).
    pub(crate) async fn push_bytes(&self, bytes: Bytes) {
        self.push(QueueItem::Envelope {
            bytes,
            error_key: None,
        })
        .await;
    }

    /// Queue a transport fault to be surfaced by the next receive.
    pub(crate) async fn push_fault(&self, err: AgentError) {
        self.push(QueueItem::Fault(err)).await;
    }

    async fn push(&self, item: QueueItem) {
        let mut item = Some(item);
        loop {
            {
                let mut items = self.items.lock().expect("queue lock poisoned");
                if items.len() < self.capacity {
                    items.push_back(item.take().expect("item consumed twice"));
                    self.readable.notify_one();
                    return;
                }
                // Overflow: only duplicate error envelopes may be dropped.
                if let Some(QueueItem::Envelope {
                    error_key: Some(key),
                    ..
                }) = item.as_ref()
                {
                    let duplicate = items.iter().any(|queued| {
                        matches!(queued,
                            QueueItem::Envelope { error_key: Some(existing), .. }
                                if existing == key)
                    });
                    if duplicate {
                        return;
                    }
                }
            }
            self.writable.notified().await;
        }
    }

    /// Pop the next item, waiting when empty.
    pub(crate) async fn pop(&self) -> Result<Bytes, AgentError> {
        loop {
            {
                let mut items = self.items.lock().expect("queue lock poisoned");
                if let Some(item) = items.pop_front() {
                    self.writable.notify_one();
                    return match item {
                        QueueItem::Envelope { bytes, .. } => Ok(bytes),
                        QueueItem::Fault(err) => Err(err),
                    };
                }
            }
            self.readable.notified().await;
        }
    }

    /// Discard everything queued (a new logical request supersedes leftover
    /// replies of an abandoned one).
    pub(crate) fn clear(&self) {
        self.items.lock().expect("queue lock poisoned").clear();
        self.writable.notify_one();
    }
}
