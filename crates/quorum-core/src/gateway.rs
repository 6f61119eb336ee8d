//! Gateway policy over a provider client: message normalization (the
//! alternation rule), bounded retries with backoff + jitter, timeouts.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time;

use quorum_provider::{
    is_retryable_error, is_timeout_error, ChatClient, ChatMessage, ChatRequest, ChatResponse,
    ChunkStream,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

const BASE_BACKOFF_MS: u64 = 500;
const MAX_JITTER_MS: u64 = 250;
const DEFAULT_ATTEMPT_BUDGET: u32 = 3;

/// Recognized per-call options.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Option<Vec<String>>,
    pub top_p: Option<f32>,
    pub timeout: Duration,
    pub attempt_budget: u32,
}

impl ChatParams {
    /// Agent-call defaults from the engine config.
    pub fn agent(config: &EngineConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            max_tokens: config.model_max_tokens,
            temperature: config.model_temperature,
            stop: None,
            top_p: None,
            timeout: config.agent_timeout,
            attempt_budget: DEFAULT_ATTEMPT_BUDGET,
        }
    }

    /// Classifier calls: small output, low temperature, short timeout.
    pub fn classifier(config: &EngineConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            max_tokens: 256,
            temperature: 0.1,
            stop: None,
            top_p: None,
            timeout: config.classifier_timeout,
            attempt_budget: 1,
        }
    }
}

/// Provider-agnostic chat gateway. Shared across requests; holds the
/// provider's connection pool through the underlying reqwest client.
pub struct ModelGateway {
    client: Arc<dyn ChatClient>,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self { client }
    }

    pub async fn health(&self) -> bool {
        self.client.health().await.is_ok()
    }

    /// Unary completion. Transport errors retry up to `attempt_budget`
    /// with exponential backoff + jitter; a timeout retries once; protocol
    /// errors surface immediately. Exhaustion is `ModelUnavailable`.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: &ChatParams,
    ) -> EngineResult<ChatResponse> {
        let request = self.build_request(messages, params)?;

        let mut attempts = 0u32;
        let mut timeout_retried = false;
        loop {
            match time::timeout(params.timeout, self.client.complete(request.clone())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) if is_timeout_error(&err) => {
                    if timeout_retried {
                        return Err(EngineError::ModelUnavailable(err.to_string()));
                    }
                    timeout_retried = true;
                    tracing::warn!("model call timed out upstream, retrying once");
                }
                Ok(Err(err)) if is_retryable_error(&err) && attempts < params.attempt_budget => {
                    attempts += 1;
                    let backoff = backoff_with_jitter(attempts);
                    tracing::warn!(
                        "model call failed (attempt {attempts}/{}), backing off {backoff:?}: {err}",
                        params.attempt_budget
                    );
                    time::sleep(backoff).await;
                }
                Ok(Err(err)) => return Err(EngineError::ModelUnavailable(err.to_string())),
                Err(_elapsed) if !timeout_retried => {
                    timeout_retried = true;
                    tracing::warn!("model call hit the {:?} deadline, retrying once", params.timeout);
                }
                Err(_elapsed) => {
                    return Err(EngineError::ModelUnavailable(format!(
                        "model call timed out after {:?}",
                        params.timeout
                    )))
                }
            }
        }
    }

    /// Open a streaming completion. Retry policy applies to establishing
    /// the stream; chunks already yielded stay valid if the caller drops
    /// the stream early, and dropping closes the upstream fetch.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &ChatParams,
    ) -> EngineResult<ChunkStream> {
        let request = self.build_request(messages, params)?;

        let mut attempts = 0u32;
        loop {
            match time::timeout(params.timeout, self.client.stream(request.clone())).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) if is_retryable_error(&err) && attempts < params.attempt_budget => {
                    attempts += 1;
                    let backoff = backoff_with_jitter(attempts);
                    tracing::warn!(
                        "model stream failed to open (attempt {attempts}/{}), backing off {backoff:?}: {err}",
                        params.attempt_budget
                    );
                    time::sleep(backoff).await;
                }
                Ok(Err(err)) => return Err(EngineError::ModelUnavailable(err.to_string())),
                Err(_elapsed) => {
                    return Err(EngineError::ModelUnavailable(format!(
                        "model stream open timed out after {:?}",
                        params.timeout
                    )))
                }
            }
        }
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        params: &ChatParams,
    ) -> EngineResult<ChatRequest> {
        let messages = normalize_messages(messages)?;
        Ok(ChatRequest {
            model: params.model_id.clone(),
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stop: params.stop.clone(),
            top_p: params.top_p,
        })
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * (1 << (attempt - 1).min(6));
    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Enforce the provider's alternation requirement: all system entries fold
/// into a single head (concatenated in order), consecutive same-role
/// entries merge with a newline, and the remainder must start with `user`
/// and strictly alternate. A sequence that still violates this after
/// merging is a programmer error.
pub fn normalize_messages(messages: Vec<ChatMessage>) -> EngineResult<Vec<ChatMessage>> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut merged: Vec<ChatMessage> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.content),
            "user" | "assistant" => match merged.last_mut() {
                Some(last) if last.role == msg.role => {
                    last.content.push('\n');
                    last.content.push_str(&msg.content);
                }
                _ => merged.push(msg),
            },
            other => {
                return Err(EngineError::ConsistencyViolation(format!(
                    "unknown message role: {other}"
                )))
            }
        }
    }

    match merged.first() {
        None => {
            return Err(EngineError::ConsistencyViolation(
                "no user message to send".into(),
            ))
        }
        Some(first) if first.role != "user" => {
            return Err(EngineError::ConsistencyViolation(
                "conversation must start with a user message".into(),
            ))
        }
        _ => {}
    }

    let mut out = Vec::with_capacity(merged.len() + 1);
    if !system_parts.is_empty() {
        out.push(ChatMessage::system(system_parts.join("\n")));
    }
    out.extend(merged);
    Ok(out)
}
