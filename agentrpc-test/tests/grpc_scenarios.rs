//! End-to-end scenarios over the gRPC binding: the envelope contract
//! carried on the fixed protobuf schema.

use std::sync::Arc;

use agentrpc_axum::AgentServer;
use agentrpc_client::RemoteAgent;
use agentrpc_core::{Agent, ErrorCode, Message};
use agentrpc_test::agents::{EchoAgent, FailingAgent, StreamEchoAgent};
use tokio_util::sync::CancellationToken;

async fn grpc_server(agent: Arc<dyn Agent>) -> AgentServer {
    AgentServer::bind("grpc://127.0.0.1:0", agent)
        .await
        .expect("bind grpc server")
}

#[tokio::test]
async fn echo_over_grpc() {
    agentrpc_test::init_tracing();
    let server = grpc_server(Arc::new(EchoAgent)).await;
    let proxy = RemoteAgent::new("echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("Hello")).await.unwrap();
    assert_eq!(reply.role, "agent");
    assert_eq!(reply.content_str(), Some("Echo: Hello"));

    server.stop().await;
}

#[tokio::test]
async fn streaming_over_grpc() {
    agentrpc_test::init_tracing();
    let server = grpc_server(Arc::new(StreamEchoAgent { chunks: 4 })).await;
    let proxy = RemoteAgent::new("stream-echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let mut stream = proxy.stream(&ctx, Message::user("grpc_test")).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.chunks.recv().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), 4);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(
            chunk.content_str(),
            Some(format!("Chunk {i}: grpc_test").as_str())
        );
        assert_eq!(chunk.metadata["chunk_id"], serde_json::json!(i));
    }
    assert!(stream.errors.recv().await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn execution_error_over_grpc() {
    agentrpc_test::init_tracing();
    let server = grpc_server(Arc::new(FailingAgent)).await;
    let proxy = RemoteAgent::new("failing", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let err = proxy.process(&ctx, Message::user("x")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExecutionError);
    assert!(err.message().contains("intentional error"));

    server.stop().await;
}

#[tokio::test]
async fn stream_not_implemented_over_grpc() {
    agentrpc_test::init_tracing();
    let server = grpc_server(Arc::new(EchoAgent)).await;
    let proxy = RemoteAgent::new("echo", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let mut stream = proxy.stream(&ctx, Message::user("x")).await.unwrap();
    let err = stream.errors.recv().await.expect("expected an error");
    assert_eq!(err.code(), ErrorCode::NotImplemented);

    server.stop().await;
}

/// Metadata (including structured values) survives the protobuf
/// translation byte-for-byte after canonical re-serialization.
#[tokio::test]
async fn metadata_round_trip_over_grpc() {
    agentrpc_test::init_tracing();

    struct Reflector;

    #[async_trait::async_trait]
    impl Agent for Reflector {
        fn name(&self) -> &str {
            "reflector"
        }

        async fn process(
            &self,
            _ctx: &CancellationToken,
            message: Message,
        ) -> Result<Message, agentrpc_core::AgentError> {
            Ok(message)
        }
    }

    let server = grpc_server(Arc::new(Reflector)).await;
    let proxy = RemoteAgent::new("reflector", &server.url()).unwrap();
    let ctx = CancellationToken::new();

    let message = Message::user(serde_json::json!({"nested": [1, 2, {"deep": true}]}))
        .with_metadata("trace_context", serde_json::json!({"traceparent": "00-aa-bb-01"}))
        .with_metadata("tags", serde_json::json!(["a", "b"]));
    let reply = proxy.process(&ctx, message.clone()).await.unwrap();

    assert_eq!(reply.content, message.content);
    assert_eq!(reply.metadata, message.metadata);

    server.stop().await;
}
