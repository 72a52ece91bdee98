//! End-to-end scenarios over the HTTP family binding (HTTP/1.1 and h2c)
//! with SSE streaming.

use std::sync::Arc;

use agentrpc_axum::AgentServer;
use agentrpc_client::RemoteAgent;
use agentrpc_core::{Agent, ErrorCode, Message};
use agentrpc_test::agents::{EchoAgent, FailingAgent, StreamEchoAgent};
use tokio_util::sync::CancellationToken;

async fn http_server(agent: Arc<dyn Agent>) -> AgentServer {
    AgentServer::bind("http://127.0.0.1:0", agent)
        .await
        .expect("bind http server")
}

#[tokio::test]
async fn echo_over_http1() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(EchoAgent)).await;
    let proxy = RemoteAgent::new("echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("Hello")).await.unwrap();
    assert_eq!(reply.role, "agent");
    assert_eq!(reply.content_str(), Some("Echo: Hello"));

    server.stop().await;
}

#[tokio::test]
async fn echo_over_h2c() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(EchoAgent)).await;
    // Same listener, HTTP/2 prior-knowledge client.
    let url = server.url().replace("http://", "h2c://");
    let proxy = RemoteAgent::new("echo", &url).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("Hello")).await.unwrap();
    assert_eq!(reply.content_str(), Some("Echo: Hello"));

    server.stop().await;
}

/// SSE streaming: chunks arrive in order with their metadata, then both
/// channels close cleanly.
#[tokio::test]
async fn streaming_over_sse() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(StreamEchoAgent { chunks: 5 })).await;
    let proxy = RemoteAgent::new("stream-echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let mut stream = proxy.stream(&ctx, Message::user("sse_test")).await.unwrap();
    let mut contents = Vec::new();
    while let Some(chunk) = stream.chunks.recv().await {
        contents.push(chunk.content_str().unwrap().to_string());
    }
    assert_eq!(
        contents,
        (0..5)
            .map(|i| format!("Chunk {i}: sse_test"))
            .collect::<Vec<_>>()
    );
    assert!(stream.errors.recv().await.is_none());

    server.stop().await;
}

/// The failing agent's error carries `EXECUTION_ERROR` through the HTTP
/// status/body mapping.
#[tokio::test]
async fn execution_error_over_http() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(FailingAgent)).await;
    let proxy = RemoteAgent::new("failing", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let err = proxy.process(&ctx, Message::user("x")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExecutionError);
    assert!(err.message().contains("intentional error"));

    server.stop().await;
}

/// Stream on a non-streaming agent over HTTP: 501 at the wire, a
/// `NOT_IMPLEMENTED` error on the channel.
#[tokio::test]
async fn stream_not_implemented_over_http() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(EchoAgent)).await;
    let proxy = RemoteAgent::new("echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let mut stream = proxy.stream(&ctx, Message::user("x")).await.unwrap();
    let err = stream.errors.recv().await.expect("expected an error");
    assert_eq!(err.code(), ErrorCode::NotImplemented);

    server.stop().await;
}

/// The health endpoints answer with their status documents.
#[tokio::test]
async fn health_endpoints() {
    agentrpc_test::init_tracing();
    let server = http_server(Arc::new(EchoAgent)).await;
    let base = server.url();

    let stream = tokio::net::TcpStream::connect(base.trim_start_matches("http://"))
        .await
        .unwrap();
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
    tokio::spawn(conn);

    for (path, expected_status) in [("/health", "healthy"), ("/live", "alive"), ("/ready", "ready")]
    {
        let req = http::Request::builder()
            .uri(path)
            .header("host", "localhost")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), 200, "{path}");
        let body = {
            use http_body_util::BodyExt;
            resp.into_body().collect().await.unwrap().to_bytes()
        };
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["status"], expected_status, "{path}");
    }

    server.stop().await;
}
