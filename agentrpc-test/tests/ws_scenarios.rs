//! WebSocket adapter scenarios, against an in-test axum WebSocket peer
//! speaking the envelope contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agentrpc_client::RemoteAgent;
use agentrpc_core::{Agent, Envelope, ErrorCode, Message, RequestMethod};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct PeerState {
    /// Connections accepted so far; used by the reconnect test.
    connections: Arc<AtomicUsize>,
    /// Drop connections abruptly after this many exchanges (0 = never).
    drop_after_exchanges: usize,
}

async fn ws_upgrade(State(state): State<PeerState>, ws: WebSocketUpgrade) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_envelopes(socket, state))
}

/// Answer envelope requests: `process` echoes, `stream` sends three chunks
/// and an end marker.
async fn serve_envelopes(mut socket: WebSocket, state: PeerState) {
    let mut exchanges = 0usize;
    while let Some(Ok(message)) = socket.recv().await {
        let data = match message {
            WsMessage::Binary(data) => data,
            WsMessage::Text(text) => text.as_bytes().to_vec().into(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = Envelope::decode(&data) else {
            continue;
        };
        let Ok(message) = envelope.payload_message() else {
            continue;
        };
        let text = message.content_str().unwrap_or_default();

        match envelope.request_method() {
            Ok(RequestMethod::Process) => {
                let reply =
                    Envelope::response(&envelope.id, &Message::agent(format!("Echo: {text}")))
                        .unwrap();
                if socket
                    .send(WsMessage::Binary(reply.encode().unwrap().to_vec().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(RequestMethod::Stream) => {
                for i in 0..3 {
                    let chunk = Envelope::stream_chunk(
                        &envelope.id,
                        &Message::agent(format!("Chunk {i}: {text}")),
                    )
                    .unwrap();
                    if socket
                        .send(WsMessage::Binary(chunk.encode().unwrap().to_vec().into()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let end = Envelope::stream_end(&envelope.id);
                let _ = socket
                    .send(WsMessage::Binary(end.encode().unwrap().to_vec().into()))
                    .await;
            }
            Err(_) => {
                let err = Envelope::error(
                    &envelope.id,
                    ErrorCode::InvalidMessage,
                    "unknown method",
                );
                let _ = socket
                    .send(WsMessage::Binary(err.encode().unwrap().to_vec().into()))
                    .await;
            }
        }

        exchanges += 1;
        if state.drop_after_exchanges > 0 && exchanges >= state.drop_after_exchanges {
            // Abrupt drop, no close frame.
            return;
        }
    }
}

async fn spawn_peer(state: PeerState) -> String {
    let app = Router::new()
        .route("/agent", any(ws_upgrade))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/agent")
}

#[tokio::test]
async fn echo_over_websocket() {
    agentrpc_test::init_tracing();
    let url = spawn_peer(PeerState::default()).await;
    let proxy = RemoteAgent::new("echo", &url).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("Hello")).await.unwrap();
    assert_eq!(reply.content_str(), Some("Echo: Hello"));

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn streaming_over_websocket() {
    agentrpc_test::init_tracing();
    let url = spawn_peer(PeerState::default()).await;
    let proxy = RemoteAgent::new("stream-echo", &url).unwrap();
    let ctx = CancellationToken::new();

    let mut stream = proxy.stream(&ctx, Message::user("ws_test")).await.unwrap();
    let mut contents = Vec::new();
    while let Some(chunk) = stream.chunks.recv().await {
        contents.push(chunk.content_str().unwrap().to_string());
    }
    assert_eq!(
        contents,
        (0..3)
            .map(|i| format!("Chunk {i}: ws_test"))
            .collect::<Vec<_>>()
    );
    assert!(stream.errors.recv().await.is_none());

    proxy.close().await.unwrap();
}

/// After the peer drops the connection abruptly, the adapter reconnects
/// under its backoff policy and later calls succeed on the fresh
/// connection.
#[tokio::test]
async fn reconnect_after_abrupt_drop() {
    agentrpc_test::init_tracing();
    let connections = Arc::new(AtomicUsize::new(0));
    let url = spawn_peer(PeerState {
        connections: Arc::clone(&connections),
        drop_after_exchanges: 1,
    })
    .await;
    let proxy = RemoteAgent::new("echo", &url).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("first")).await.unwrap();
    assert_eq!(reply.content_str(), Some("Echo: first"));

    // The peer dropped us after the first exchange; within a few attempts
    // the adapter must have reconnected.
    let mut recovered = false;
    for _ in 0..4 {
        if let Ok(reply) = proxy.process(&ctx, Message::user("second")).await {
            assert_eq!(reply.content_str(), Some("Echo: second"));
            recovered = true;
            break;
        }
    }
    assert!(recovered, "websocket adapter did not recover");
    assert!(
        connections.load(Ordering::SeqCst) >= 2,
        "no reconnection happened"
    );

    proxy.close().await.unwrap();
}
