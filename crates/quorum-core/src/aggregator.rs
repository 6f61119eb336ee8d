use std::collections::HashSet;
use std::sync::Arc;

use quorum_provider::{ChatMessage, ChunkStream};
use quorum_schema::{AgentReply, Contributor};

use crate::error::{EngineError, EngineResult};
use crate::gateway::{ChatParams, ModelGateway};
use crate::prompts::{PromptStore, AGGREGATOR_SYNTHESIZE};

/// An aggregator output keeps every dispatched agent in `contributors`;
/// `used` marks whether the final text meaningfully incorporated that
/// agent's content.
const USED_JACCARD_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct Aggregated {
    pub content: String,
    pub contributors: Vec<Contributor>,
    /// False when a single agent's output was passed through unchanged.
    pub synthesized: bool,
}

/// Synthesizes the ordered agent outputs into one attributed reply.
pub struct Aggregator {
    gateway: Arc<ModelGateway>,
    prompts: Arc<PromptStore>,
    params: ChatParams,
}

impl Aggregator {
    pub fn new(gateway: Arc<ModelGateway>, prompts: Arc<PromptStore>, params: ChatParams) -> Self {
        Self {
            gateway,
            prompts,
            params,
        }
    }

    pub async fn aggregate(&self, query: &str, replies: &[AgentReply]) -> EngineResult<Aggregated> {
        match replies {
            [] => Err(EngineError::ConsistencyViolation(
                "aggregator invoked with no agent outputs".into(),
            )),
            [only] => Ok(single_passthrough(only)),
            _ => {
                let prompt = self.render(query, replies)?;
                match self
                    .gateway
                    .complete(vec![ChatMessage::user(prompt)], &self.params)
                    .await
                {
                    Ok(response) => Ok(Aggregated {
                        contributors: contributors_for(replies, &response.text),
                        content: response.text,
                        synthesized: true,
                    }),
                    Err(e) => {
                        // Best effort: stitch the usable outputs together
                        // rather than failing a run that has content.
                        tracing::warn!("synthesis call failed, stitching outputs: {e}");
                        let content = stitch_outputs(replies);
                        Ok(Aggregated {
                            contributors: contributors_for(replies, &content),
                            content,
                            synthesized: true,
                        })
                    }
                }
            }
        }
    }

    /// Open the synthesis call as a stream; the caller accumulates the text
    /// and derives contributors with [`contributors_for`] once complete.
    pub async fn open_stream(&self, query: &str, replies: &[AgentReply]) -> EngineResult<ChunkStream> {
        let prompt = self.render(query, replies)?;
        self.gateway
            .stream(vec![ChatMessage::user(prompt)], &self.params)
            .await
    }

    fn render(&self, query: &str, replies: &[AgentReply]) -> EngineResult<String> {
        self.prompts.render(
            AGGREGATOR_SYNTHESIZE,
            &[("query", query), ("outputs", &outputs_block(replies))],
        )
    }
}

fn single_passthrough(reply: &AgentReply) -> Aggregated {
    Aggregated {
        content: reply.content.clone(),
        contributors: vec![Contributor {
            agent: reply.agent.clone(),
            confidence: reply.confidence,
            used: reply.confidence > 0.0,
        }],
        synthesized: false,
    }
}

fn outputs_block(replies: &[AgentReply]) -> String {
    replies
        .iter()
        .map(|r| format!("### {} (confidence {:.2})\n{}", r.agent, r.confidence, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn stitch_outputs(replies: &[AgentReply]) -> String {
    replies
        .iter()
        .filter(|r| r.confidence > 0.0)
        .map(|r| format!("[{}] {}", r.agent, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One entry per dispatched agent, in dispatch order. Failed agents are
/// never `used`; the rest are judged by token overlap with the final text.
pub fn contributors_for(replies: &[AgentReply], final_text: &str) -> Vec<Contributor> {
    replies
        .iter()
        .map(|reply| Contributor {
            agent: reply.agent.clone(),
            confidence: reply.confidence,
            used: reply.confidence > 0.0
                && trigram_jaccard(&reply.content, final_text) >= USED_JACCARD_THRESHOLD,
        })
        .collect()
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity over word trigrams; short texts fall back to word
/// sets so two-word replies are still comparable.
fn trigram_jaccard(a: &str, b: &str) -> f64 {
    let words_a = words(a);
    let words_b = words(b);

    let (set_a, set_b): (HashSet<String>, HashSet<String>) =
        if words_a.len() < 3 || words_b.len() < 3 {
            (
                words_a.into_iter().collect(),
                words_b.into_iter().collect(),
            )
        } else {
            (
                words_a.windows(3).map(|w| w.join(" ")).collect(),
                words_b.windows(3).map(|w| w.join(" ")).collect(),
            )
        };

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f64 / union as f64
}
