//! WebSocket adapter: persistent duplex, one envelope per message.
//!
//! No length prefix is needed — WebSocket frames the messages. A keepalive
//! task PINGs on a fixed cadence and the connection counts as broken when no
//! traffic (PONGs included) is seen within the keepalive timeout. When a
//! send or receive fails on a previously healthy connection, the adapter
//! reconnects under the bounded backoff policy before surfacing
//! `CONNECTION_FAILED`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use agentrpc_core::AgentError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Transport, TransportOptions};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    url: String,
    options: TransportOptions,
    sink: Arc<Mutex<Option<WsSink>>>,
    source: Mutex<Option<WsSource>>,
    connected: Arc<AtomicBool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    last_activity: Arc<std::sync::Mutex<Instant>>,
}

impl WsTransport {
    pub fn new(tls: bool, authority: String, options: TransportOptions) -> Self {
        let scheme = if tls { "wss" } else { "ws" };
        Self {
            url: format!("{scheme}://{authority}"),
            options,
            sink: Arc::new(Mutex::new(None)),
            source: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            keepalive: Mutex::new(None),
            last_activity: Arc::new(std::sync::Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn open(&self) -> Result<(), AgentError> {
        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            AgentError::ConnectionFailed(format!("connect {} failed: {e}", self.url))
        })?;
        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        self.connected.store(true, Ordering::SeqCst);
        self.touch();
        self.spawn_keepalive().await;
        debug!(url = %self.url, "websocket connected");
        Ok(())
    }

    async fn spawn_keepalive(&self) {
        let mut guard = self.keepalive.lock().await;
        if let Some(task) = guard.take() {
            task.abort();
        }
        let sink = Arc::clone(&self.sink);
        let connected = Arc::clone(&self.connected);
        let last_activity = Arc::clone(&self.last_activity);
        let interval = self.options.keepalive_interval;
        let timeout = self.options.keepalive_timeout;
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let stale = last_activity
                    .lock()
                    .expect("activity lock poisoned")
                    .elapsed()
                    > timeout;
                if stale {
                    warn!("websocket keepalive timeout, marking connection broken");
                    connected.store(false, Ordering::SeqCst);
                    return;
                }
                let mut sink = sink.lock().await;
                match sink.as_mut() {
                    Some(sink) => {
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    None => return,
                }
            }
        }));
    }

    /// Reconnect under the backoff policy. On success the transport is
    /// healthy again.
    async fn reconnect_with_backoff(&self) -> Result<(), AgentError> {
        let mut last_err =
            AgentError::ConnectionFailed("reconnect attempts exhausted".to_string());
        for delay in self.options.reconnect.iter() {
            tokio::time::sleep(delay).await;
            debug!(url = %self.url, "websocket reconnect attempt");
            match self.open().await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn try_send(&self, payload: Bytes) -> Result<(), AgentError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| AgentError::ConnectionFailed("transport not connected".into()))?;
        sink.send(Message::Binary(payload)).await.map_err(|e| {
            self.mark_disconnected();
            AgentError::ConnectionFailed(format!("websocket send failed: {e}"))
        })?;
        self.touch();
        Ok(())
    }

    fn was_ever_connected(&self) -> bool {
        // A present sink means a connection was established at some point.
        self.sink.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, deadline: Duration) -> Result<(), AgentError> {
        if self.is_connected() {
            return Ok(());
        }
        tokio::time::timeout(deadline, self.open())
            .await
            .map_err(|_| {
                AgentError::ConnectionTimeout(format!("connect {} timed out", self.url))
            })?
    }

    async fn send_framed(&self, payload: Bytes, deadline: Duration) -> Result<(), AgentError> {
        let attempt = async {
            match self.try_send(payload.clone()).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    if !self.was_ever_connected() {
                        return Err(err);
                    }
                    // Previously healthy: reconnect, then retry the send once
                    // (the frame never reached the peer).
                    self.reconnect_with_backoff().await?;
                    self.try_send(payload).await
                }
            }
        };
        tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| AgentError::ConnectionTimeout("send deadline exceeded".into()))?
    }

    async fn receive_framed(&self, deadline: Duration) -> Result<Bytes, AgentError> {
        let attempt = async {
            loop {
                let item = {
                    let mut guard = self.source.lock().await;
                    let source = guard.as_mut().ok_or_else(|| {
                        AgentError::ConnectionFailed("transport not connected".into())
                    })?;
                    source.next().await
                };
                match item {
                    Some(Ok(Message::Binary(payload))) => {
                        self.touch();
                        return Ok(payload);
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.touch();
                        return Ok(Bytes::from(text));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Pongs answer our keepalive; pings are answered by
                        // tungstenite on the next flush.
                        self.touch();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.mark_disconnected();
                        return Err(AgentError::ConnectionClosed);
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => {
                        self.mark_disconnected();
                        // Restore transport health for the next logical call;
                        // the in-flight reply is gone either way.
                        let _ = self.reconnect_with_backoff().await;
                        return Err(AgentError::ConnectionFailed(format!(
                            "websocket receive failed: {e}"
                        )));
                    }
                }
            }
        };
        tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| AgentError::ConnectionTimeout("receive deadline exceeded".into()))?
    }

    async fn close(&self) -> Result<(), AgentError> {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.source.lock().await.take();
        self.mark_disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
