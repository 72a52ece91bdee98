//! HTTP/3 parity: the `h3://` transport produces results byte-identical to
//! the `http://` case for the echo and large-payload scenarios.

use std::sync::Arc;

use agentrpc_axum::AgentServer;
use agentrpc_client::{RemoteAgent, TransportOptions};
use agentrpc_core::{Agent, ErrorCode, Message};
use agentrpc_test::agents::{EchoAgent, StreamEchoAgent};
use tokio_util::sync::CancellationToken;

/// Self-signed TLS material for the QUIC listener.
fn test_tls() -> rustls::ServerConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .expect("generate certificate");
    let cert_der = certified.cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        certified.key_pair.serialize_der().into(),
    );
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("build server config")
}

fn h3_proxy(name: &str, url: &str) -> RemoteAgent {
    let options = TransportOptions {
        danger_accept_invalid_certs: true,
        ..TransportOptions::default()
    };
    RemoteAgent::with_options(name, url, options).unwrap()
}

async fn bind_h3(agent: Arc<dyn agentrpc_core::Agent>) -> AgentServer {
    AgentServer::bind_with_tls("h3://127.0.0.1:0", agent, test_tls())
        .await
        .expect("bind h3 server")
}

#[tokio::test]
async fn echo_parity_with_http() {
    agentrpc_test::init_tracing();
    let ctx = CancellationToken::new();

    let http_server = AgentServer::bind("http://127.0.0.1:0", Arc::new(EchoAgent))
        .await
        .unwrap();
    let http_proxy = RemoteAgent::new("echo", &http_server.url()).unwrap();
    let over_http = http_proxy
        .process(&ctx, Message::user("Hello"))
        .await
        .unwrap();

    let h3_server = bind_h3(Arc::new(EchoAgent)).await;
    let proxy = h3_proxy("echo", &h3_server.url());
    let over_h3 = proxy.process(&ctx, Message::user("Hello")).await.unwrap();

    assert_eq!(over_h3.role, over_http.role);
    assert_eq!(over_h3.content, over_http.content);
    assert_eq!(over_h3.metadata, over_http.metadata);

    http_server.stop().await;
    h3_server.stop().await;
}

#[tokio::test]
async fn large_payload_parity_with_http() {
    agentrpc_test::init_tracing();
    let ctx = CancellationToken::new();
    let payload = "x".repeat(1_048_576);

    let h3_server = bind_h3(Arc::new(EchoAgent)).await;
    let proxy = h3_proxy("echo", &h3_server.url());
    let reply = proxy
        .process(&ctx, Message::user(payload.clone()))
        .await
        .unwrap();

    let content = reply.content_str().unwrap();
    assert_eq!(content.len(), "Echo: ".len() + 1_048_576);
    assert_eq!(&content[6..], payload);

    h3_server.stop().await;
}

#[tokio::test]
async fn streaming_over_h3() {
    agentrpc_test::init_tracing();
    let ctx = CancellationToken::new();

    let h3_server = bind_h3(Arc::new(StreamEchoAgent { chunks: 3 })).await;
    let proxy = h3_proxy("stream-echo", &h3_server.url());

    let mut stream = proxy.stream(&ctx, Message::user("h3_test")).await.unwrap();
    let mut contents = Vec::new();
    while let Some(chunk) = stream.chunks.recv().await {
        contents.push(chunk.content_str().unwrap().to_string());
    }
    assert_eq!(
        contents,
        (0..3)
            .map(|i| format!("Chunk {i}: h3_test"))
            .collect::<Vec<_>>()
    );
    assert!(stream.errors.recv().await.is_none());

    h3_server.stop().await;
}

#[tokio::test]
async fn stream_not_implemented_over_h3() {
    agentrpc_test::init_tracing();
    let ctx = CancellationToken::new();

    let h3_server = bind_h3(Arc::new(EchoAgent)).await;
    let proxy = h3_proxy("echo", &h3_server.url());

    let mut stream = proxy.stream(&ctx, Message::user("x")).await.unwrap();
    let err = stream.errors.recv().await.expect("expected an error");
    assert_eq!(err.code(), ErrorCode::NotImplemented);

    h3_server.stop().await;
}
