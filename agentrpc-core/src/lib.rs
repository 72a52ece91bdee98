//! Core protocol types for agentrpc.
//!
//! This crate provides shared types and functions used by both the server
//! (`agentrpc-axum`) and client (`agentrpc-client`) crates.
//!
//! ## Modules
//!
//! - [`error`]: Protocol error codes and error types
//! - [`message`]: The payload the framework moves
//! - [`envelope`]: The wire envelope and its JSON codec
//! - [`framing`]: Length-prefixed framing for stream sockets
//! - [`endpoint`]: URL scheme parsing for transport selection
//! - [`agent`]: The agent contract shared by dispatchers and proxies
//! - [`proto`]: Protobuf wire types for the gRPC adapter

mod agent;
mod endpoint;
mod envelope;
mod error;
mod framing;
mod message;
pub mod proto;

pub use agent::*;
pub use endpoint::*;
pub use envelope::*;
pub use error::*;
pub use framing::*;
pub use message::*;
