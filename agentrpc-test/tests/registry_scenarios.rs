//! Registry scenarios: TTL pruning and wiring named peers to endpoints.

use std::sync::Arc;
use std::time::Duration;

use agentrpc_axum::AgentServer;
use agentrpc_client::RemoteAgent;
use agentrpc_core::{Agent, Message};
use agentrpc_registry::{AgentRegistration, Registry, heartbeat_loop};
use agentrpc_test::agents::EchoAgent;
use tokio_util::sync::CancellationToken;

/// Register a0..a2 with a 200 ms TTL, heartbeat only a1 at 100 ms: the
/// prune at 250 ms removes exactly a0 and a2.
#[tokio::test]
async fn prune_keeps_heartbeaten_agent() {
    agentrpc_test::init_tracing();
    let registry = Registry::with_timeouts(Duration::from_millis(200), Duration::from_secs(60));
    for name in ["a0", "a1", "a2"] {
        registry
            .register(AgentRegistration::new(name, "tcp://127.0.0.1:9000"))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.heartbeat("a1").unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(registry.prune_stale(), 2);
    assert!(registry.lookup("a1").is_some());
    assert!(registry.lookup("a0").is_none());
    assert!(registry.lookup("a2").is_none());
}

/// A registered endpoint wires straight into a working proxy: register the
/// server, look it up by name, call through the discovered URL.
#[tokio::test]
async fn lookup_wires_proxy_to_server() {
    agentrpc_test::init_tracing();
    let server = AgentServer::bind("tcp://127.0.0.1:0", Arc::new(EchoAgent))
        .await
        .unwrap();

    let registry = Arc::new(Registry::new());
    registry
        .register(
            AgentRegistration::new("echo", server.url())
                .with_capability("streaming", false)
                .with_metadata("region", "local"),
        )
        .unwrap();

    let registration = registry.lookup("echo").expect("echo registered");
    let proxy = RemoteAgent::new(&registration.name, &registration.endpoint).unwrap();
    let ctx = CancellationToken::new();

    let reply = proxy.process(&ctx, Message::user("Hello")).await.unwrap();
    assert_eq!(reply.content_str(), Some("Echo: Hello"));

    server.stop().await;
}

/// The heartbeat helper keeps a registration alive past several TTL
/// windows, and the prune task leaves it alone while reaping a silent
/// peer.
#[tokio::test]
async fn heartbeat_loop_with_prune_task() {
    agentrpc_test::init_tracing();
    let registry = Arc::new(Registry::with_timeouts(
        Duration::from_millis(150),
        Duration::from_millis(50),
    ));
    registry
        .register(AgentRegistration::new("kept", "tcp://127.0.0.1:9000"))
        .unwrap();
    registry
        .register(AgentRegistration::new("silent", "tcp://127.0.0.1:9001"))
        .unwrap();

    let ctx = CancellationToken::new();
    registry.start(&ctx);

    let beat_registry = Arc::clone(&registry);
    let beat_ctx = ctx.clone();
    let beater = tokio::spawn(async move {
        heartbeat_loop(beat_ctx, beat_registry, "kept", Duration::from_millis(50)).await;
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(registry.lookup("kept").is_some(), "heartbeats ignored");
    assert!(registry.lookup("silent").is_none(), "stale peer survived");

    ctx.cancel();
    beater.await.unwrap();
    registry.stop().await;
}
