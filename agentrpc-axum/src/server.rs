//! Server-side endpoint wiring: bind a URL, get the matching binding.

use std::sync::Arc;

use agentrpc_core::{Agent, AgentError, Endpoint, HttpScheme};
use tracing::debug;

use crate::http::HttpServer;
use crate::http3::H3Server;
use crate::socket::SocketServer;

#[cfg(feature = "tonic")]
use crate::grpc::GrpcServer;

/// One running server, whichever binding the endpoint URL selected.
pub enum AgentServer {
    Socket(SocketServer),
    Http(HttpServer),
    H3(H3Server),
    #[cfg(feature = "tonic")]
    Grpc(GrpcServer),
}

impl AgentServer {
    /// Bind an endpoint URL and start serving.
    ///
    /// `unix://` and `tcp://` select the stream-socket binding; `http://`
    /// and `h2c://` the axum binding (one listener serves both); `grpc://`
    /// the tonic binding (feature `tonic`). `h3://` and `https://` need TLS
    /// material — use [`bind_with_tls`](Self::bind_with_tls).
    pub async fn bind(url: &str, agent: Arc<dyn Agent>) -> Result<Self, AgentError> {
        let endpoint = Endpoint::parse(url)?;
        debug!(endpoint = %endpoint, "binding server");
        match &endpoint {
            Endpoint::Unix { .. } | Endpoint::Tcp { .. } => {
                Ok(Self::Socket(SocketServer::bind(&endpoint, agent).await?))
            }
            Endpoint::Http {
                scheme: HttpScheme::Http | HttpScheme::H2c,
                authority,
            } => Ok(Self::Http(HttpServer::bind(authority, agent).await?)),
            Endpoint::Http {
                scheme: HttpScheme::H3 | HttpScheme::Https,
                ..
            } => Err(AgentError::invalid_request(format!(
                "{url} requires TLS material; use bind_with_tls"
            ))),
            Endpoint::Grpc { host, port } => {
                #[cfg(feature = "tonic")]
                {
                    Ok(Self::Grpc(
                        GrpcServer::bind(&format!("{host}:{port}"), agent).await?,
                    ))
                }
                #[cfg(not(feature = "tonic"))]
                {
                    let _ = (host, port);
                    Err(AgentError::not_implemented(
                        "grpc serving requires the `tonic` feature",
                    ))
                }
            }
            Endpoint::Ws { .. } => Err(AgentError::invalid_request(
                "websocket serving is not provided by this crate; bind an http endpoint",
            )),
        }
    }

    /// Bind a TLS-bearing endpoint URL (`h3://`).
    ///
    /// `https://` termination is left to a fronting proxy; QUIC cannot be,
    /// so `h3://` takes the rustls config directly.
    pub async fn bind_with_tls(
        url: &str,
        agent: Arc<dyn Agent>,
        tls: rustls::ServerConfig,
    ) -> Result<Self, AgentError> {
        let endpoint = Endpoint::parse(url)?;
        match &endpoint {
            Endpoint::Http {
                scheme: HttpScheme::H3,
                authority,
            } => {
                let addr = resolve(authority).await?;
                Ok(Self::H3(H3Server::bind(addr, tls, agent).await?))
            }
            _ => Err(AgentError::invalid_request(format!(
                "bind_with_tls supports h3:// endpoints, got {url}"
            ))),
        }
    }

    /// The concrete bound URL (with the kernel-assigned port, if port 0 was
    /// requested).
    pub fn url(&self) -> String {
        match self {
            Self::Socket(s) => s
                .local_addr()
                .map(|addr| format!("tcp://{addr}"))
                .or_else(|| s.unix_path().map(|p| format!("unix://{}", p.display())))
                .unwrap_or_default(),
            Self::Http(s) => format!("http://{}", s.local_addr()),
            Self::H3(s) => format!("h3://{}", s.local_addr()),
            #[cfg(feature = "tonic")]
            Self::Grpc(s) => format!("grpc://{}", s.local_addr()),
        }
    }

    /// Stop the underlying binding. Idempotent.
    pub async fn stop(&self) {
        match self {
            Self::Socket(s) => s.stop().await,
            Self::Http(s) => s.stop().await,
            Self::H3(s) => s.stop().await,
            #[cfg(feature = "tonic")]
            Self::Grpc(s) => s.stop().await,
        }
    }
}

async fn resolve(authority: &str) -> Result<std::net::SocketAddr, AgentError> {
    tokio::net::lookup_host(authority)
        .await
        .map_err(|e| AgentError::invalid_request(format!("cannot resolve {authority}: {e}")))?
        .next()
        .ok_or_else(|| AgentError::invalid_request(format!("no address for {authority}")))
}
