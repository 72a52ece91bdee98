//! Agent RPC client for Rust.
//!
//! This crate provides the client side of the agentrpc framework: a set of
//! transport adapters sharing one framed-message contract, and the
//! [`RemoteAgent`] proxy that makes a remote peer look like a local
//! [`Agent`](agentrpc_core::Agent).
//!
//! ## Example
//!
//! ```ignore
//! use agentrpc_client::RemoteAgent;
//! use agentrpc_core::Message;
//! use tokio_util::sync::CancellationToken;
//!
//! let agent = RemoteAgent::new("echo", "tcp://127.0.0.1:9000")?;
//! let ctx = CancellationToken::new();
//!
//! let reply = agent.process(&ctx, Message::user("Hello")).await?;
//! println!("{:?}", reply.content);
//!
//! let mut stream = agent.stream(&ctx, Message::user("Tell me more")).await?;
//! while let Some(chunk) = stream.chunks.recv().await {
//!     println!("chunk: {:?}", chunk.content);
//! }
//! ```
//!
//! The transport is chosen by the endpoint URL scheme: `unix://` and
//! `tcp://` speak length-prefixed frames, `http://`/`https://`/`h2c://` use
//! POST + Server-Sent Events, `h3://` the same over QUIC, `ws://`/`wss://` a
//! persistent WebSocket, and `grpc://` the protobuf schema.

pub mod backoff;
pub mod proxy;
pub mod transport;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use proxy::RemoteAgent;
pub use transport::{Transport, TransportOptions, connect_endpoint};
