pub mod openai;
pub mod types;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use tokio_stream::iter as stream_iter;

pub use openai::OpenAiCompatClient;
pub use types::{ChatMessage, ChatRequest, ChatResponse, StreamChunk};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Provider-agnostic chat client. Transport failures carry a
/// `[retryable]` marker in the error text; protocol errors are surfaced
/// verbatim and must not be retried.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse>;

    async fn stream(&self, _request: ChatRequest) -> Result<ChunkStream> {
        anyhow::bail!("streaming not supported by this provider")
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Deterministic in-process client. Echoes the last user message back,
/// used in tests and when no provider is configured.
pub struct StubClient;

#[async_trait]
impl ChatClient for StubClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            text: format!("[stub:{}] {}", request.model, user_text),
            stop_reason: Some("stop".into()),
            input_tokens: None,
            output_tokens: None,
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let full_text = format!("[stub:{}] {}", request.model, user_text);

        let mut chunks: Vec<Result<StreamChunk>> = full_text
            .split_whitespace()
            .map(|word| Ok(StreamChunk::delta(format!("{word} "))))
            .collect();
        chunks.push(Ok(StreamChunk::done(Some("stop".into()))));

        Ok(Box::pin(stream_iter(chunks)))
    }
}

/// True when an error's text carries the transport-retry marker.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    err.to_string().contains("[retryable]")
}

/// True when an error's text marks a timeout specifically.
pub fn is_timeout_error(err: &anyhow::Error) -> bool {
    err.to_string().contains("(timeout)")
}
