//! Test agents used across the integration suites.

use std::time::Duration;

use agentrpc_core::{Agent, AgentError, AgentStream, Message};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Replies with `Echo: <content>`.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError> {
        let text = message
            .content_str()
            .ok_or_else(|| AgentError::execution("content must be a string"))?;
        Ok(Message::agent(format!("Echo: {text}")))
    }
}

/// Streams `Chunk <i>: <content>` messages with `chunk_id` metadata, then
/// ends cleanly.
pub struct StreamEchoAgent {
    pub chunks: usize,
}

#[async_trait]
impl Agent for StreamEchoAgent {
    fn name(&self) -> &str {
        "stream-echo"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process".into(), "stream".into()]
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError> {
        let text = message.content_str().unwrap_or_default();
        Ok(Message::agent(format!("Echo: {text}")))
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        message: Message,
    ) -> Result<AgentStream, AgentError> {
        let text = message.content_str().unwrap_or_default().to_string();
        let count = self.chunks;
        let (tx, stream) = AgentStream::channel(8);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for i in 0..count {
                if ctx.is_cancelled() {
                    return;
                }
                let chunk = Message::agent(format!("Chunk {i}: {text}"))
                    .with_metadata("chunk_id", i as u64);
                if tx.chunks.send(chunk).await.is_err() {
                    return;
                }
            }
        });
        Ok(stream)
    }
}

/// Fails every `process` call with `intentional error`.
pub struct FailingAgent;

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        "failing"
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        _message: Message,
    ) -> Result<Message, AgentError> {
        Err(AgentError::execution("intentional error"))
    }
}

/// Opens a stream and never produces anything, until cancelled.
pub struct StuckStreamAgent;

#[async_trait]
impl Agent for StuckStreamAgent {
    fn name(&self) -> &str {
        "stuck"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process".into(), "stream".into()]
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError> {
        Ok(message)
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        _message: Message,
    ) -> Result<AgentStream, AgentError> {
        let (tx, stream) = AgentStream::channel(1);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _tx = tx;
            ctx.cancelled().await;
        });
        Ok(stream)
    }
}

/// Sleeps before answering; for timeout tests.
pub struct SlowAgent {
    pub delay: Duration,
}

#[async_trait]
impl Agent for SlowAgent {
    fn name(&self) -> &str {
        "slow"
    }

    async fn process(
        &self,
        _ctx: &CancellationToken,
        message: Message,
    ) -> Result<Message, AgentError> {
        tokio::time::sleep(self.delay).await;
        Ok(message)
    }
}
