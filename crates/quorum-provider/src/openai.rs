//! OpenAI-compatible chat client. Works against any endpoint speaking the
//! `/chat/completions` shape (OpenAI, vLLM, Ollama, LiteLLM, ...).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::{ChatClient, ChatRequest, ChatResponse, ChunkStream, StreamChunk};

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 404 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Timeout)
    }
}

impl OpenAiCompatClient {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: ChatRequest, stream: bool) -> ApiRequest {
        ApiRequest {
            model: request.model,
            messages: request
                .messages
                .into_iter()
                .map(|m| ApiMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop,
            top_p: request.top_p,
            stream,
        }
    }

    async fn send(&self, payload: &ApiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r),
            Err(e) if e.is_timeout() => Err(anyhow!(
                "model api error (timeout) [retryable]: request timed out"
            )),
            Err(e) if e.is_connect() => Err(anyhow!("model api error (connect) [retryable]: {e}")),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let payload = Self::to_api_request(request, false);
        let resp = self.send(&payload).await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        let body: ApiResponse = resp.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("model api error: response contained no choices"))?;

        Ok(ChatResponse {
            text: choice.message.map(|m| m.content).unwrap_or_default(),
            stop_reason: choice.finish_reason,
            input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        let payload = Self::to_api_request(request, true);
        let resp = self.send(&payload).await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/models", self.api_base);
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("model api health check failed: {}", resp.status()))
        }
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();
        let mut emitted_done = false;

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };

                            if data == "[DONE]" {
                                if !emitted_done {
                                    emitted_done = true;
                                    yield Ok(StreamChunk::done(None));
                                }
                                return;
                            }

                            match serde_json::from_str::<serde_json::Value>(data) {
                                Ok(event) => {
                                    if let Some(chunk) = parse_sse_event(&event) {
                                        if chunk.done {
                                            emitted_done = true;
                                        }
                                        yield Ok(chunk);
                                    }
                                }
                                Err(e) => {
                                    yield Err(anyhow!("invalid sse event payload: {e}"));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error [retryable]: {e}"));
                    return;
                }
            }
        }

        if !emitted_done {
            yield Ok(StreamChunk::done(None));
        }
    }
}

fn parse_sse_event(event: &serde_json::Value) -> Option<StreamChunk> {
    let choice = event.get("choices")?.as_array()?.first()?;

    if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        return Some(StreamChunk::done(Some(finish.to_string())));
    }

    let delta = choice.get("delta")?.get("content")?.as_str()?;
    Some(StreamChunk::delta(delta))
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> anyhow::Error {
    let kind = ProviderErrorKind::from_status(status);
    let retryable = if kind.is_retryable() {
        " [retryable]"
    } else {
        ""
    };
    if let Some(api_error) = parsed {
        anyhow!(
            "model api error ({status}){retryable}: {} ({})",
            api_error.error.message,
            api_error.error.r#type.unwrap_or_default()
        )
    } else {
        anyhow!("model api error ({status}){retryable}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiChoice {
    message: Option<ApiMessage2>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMessage2 {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    r#type: Option<String>,
    message: String,
}
