//! Server side of the agentrpc framework.
//!
//! A server binds one local [`Agent`](agentrpc_core::Agent) to one listener
//! and speaks the envelope protocol over it:
//!
//! - [`socket::SocketServer`]: Unix domain and TCP listeners with
//!   length-prefixed framing
//! - [`http::HttpServer`]: axum binding — health endpoints, `POST /process`,
//!   and `POST /stream` as Server-Sent Events (HTTP/1.1 and h2c)
//! - [`http3::H3Server`]: the same two routes over HTTP/3 / QUIC
//! - [`grpc::GrpcServer`] (feature `tonic`): unary + server-streaming RPCs
//!
//! The shared [`dispatcher::Dispatcher`] implements the envelope semantics
//! once; each binding only adapts framing.
//!
//! ```ignore
//! use agentrpc_axum::AgentServer;
//! use std::sync::Arc;
//!
//! let server = AgentServer::bind("tcp://127.0.0.1:9000", Arc::new(MyAgent)).await?;
//! // ...
//! server.stop().await;
//! ```

pub mod dispatcher;
pub mod http;
pub mod http3;
pub mod socket;

#[cfg(feature = "tonic")]
pub mod grpc;

mod server;

pub use dispatcher::{Dispatcher, Reply};
pub use http::HttpServer;
pub use http3::H3Server;
pub use server::AgentServer;
pub use socket::SocketServer;

#[cfg(feature = "tonic")]
pub use grpc::GrpcServer;
