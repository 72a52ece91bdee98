//! Endpoint parsing: URL scheme selects the transport adapter.
//!
//! Recognized schemes: `unix://PATH`, `tcp://HOST:PORT`, `grpc://HOST[:PORT]`
//! (default port 50051), `http[s]://AUTH`, `h2c://AUTH`, `h3://AUTH`,
//! `ws[s]://AUTH`. Any other scheme fails with `INVALID_REQUEST`.

use std::path::PathBuf;

use crate::error::AgentError;

/// Default gRPC port when the authority omits one.
pub const DEFAULT_GRPC_PORT: u16 = 50051;

/// HTTP protocol variant selected by the URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpScheme {
    /// HTTP/1.1 (upgrading to h2 via ALPN where TLS applies).
    Http,
    /// HTTP over TLS with ALPN negotiation.
    Https,
    /// HTTP/2 cleartext (prior knowledge).
    H2c,
    /// HTTP/3 over QUIC.
    H3,
}

impl HttpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
            HttpScheme::H2c => "h2c",
            HttpScheme::H3 => "h3",
        }
    }
}

/// A parsed endpoint, ready to be wired to a transport adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
    Grpc { host: String, port: u16 },
    Http { scheme: HttpScheme, authority: String },
    Ws { tls: bool, authority: String },
}

impl Endpoint {
    /// Parse an endpoint URL.
    pub fn parse(url: &str) -> Result<Self, AgentError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| AgentError::invalid_request(format!("endpoint missing scheme: {url}")))?;

        if rest.is_empty() {
            return Err(AgentError::invalid_request(format!(
                "endpoint missing address: {url}"
            )));
        }

        match scheme {
            "unix" => Ok(Endpoint::Unix {
                path: PathBuf::from(rest),
            }),
            "tcp" => {
                let (host, port) = split_host_port(rest)?;
                let port = port.ok_or_else(|| {
                    AgentError::invalid_request(format!("tcp endpoint requires a port: {url}"))
                })?;
                Ok(Endpoint::Tcp { host, port })
            }
            "grpc" => {
                let (host, port) = split_host_port(rest)?;
                Ok(Endpoint::Grpc {
                    host,
                    port: port.unwrap_or(DEFAULT_GRPC_PORT),
                })
            }
            "http" => Ok(Endpoint::Http {
                scheme: HttpScheme::Http,
                authority: rest.to_string(),
            }),
            "https" => Ok(Endpoint::Http {
                scheme: HttpScheme::Https,
                authority: rest.to_string(),
            }),
            "h2c" => Ok(Endpoint::Http {
                scheme: HttpScheme::H2c,
                authority: rest.to_string(),
            }),
            "h3" => Ok(Endpoint::Http {
                scheme: HttpScheme::H3,
                authority: rest.to_string(),
            }),
            "ws" => Ok(Endpoint::Ws {
                tls: false,
                authority: rest.to_string(),
            }),
            "wss" => Ok(Endpoint::Ws {
                tls: true,
                authority: rest.to_string(),
            }),
            other => Err(AgentError::invalid_request(format!(
                "unsupported endpoint scheme: {other}"
            ))),
        }
    }

    /// Reassemble the endpoint URL.
    pub fn url(&self) -> String {
        match self {
            Endpoint::Unix { path } => format!("unix://{}", path.display()),
            Endpoint::Tcp { host, port } => format!("tcp://{host}:{port}"),
            Endpoint::Grpc { host, port } => format!("grpc://{host}:{port}"),
            Endpoint::Http { scheme, authority } => {
                format!("{}://{authority}", scheme.as_str())
            }
            Endpoint::Ws { tls, authority } => {
                format!("{}://{authority}", if *tls { "wss" } else { "ws" })
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>), AgentError> {
    // Bracketed IPv6 literals keep their brackets in the host part.
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(']') => {
            let port = port.parse::<u16>().map_err(|_| {
                AgentError::invalid_request(format!("invalid port in endpoint: {authority}"))
            })?;
            Ok((host.to_string(), Some(port)))
        }
        _ => {
            if authority.is_empty() {
                Err(AgentError::invalid_request("empty endpoint authority"))
            } else {
                Ok((authority.to_string(), None))
            }
        }
    }
}
