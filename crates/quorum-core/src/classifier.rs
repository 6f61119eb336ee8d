use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use quorum_provider::ChatMessage;
use quorum_schema::{Message, RoutingDecision, Strategy};
use serde::Deserialize;

use crate::agent::AgentRegistry;
use crate::gateway::{ChatParams, ModelGateway};
use crate::prompts::{PromptStore, CLASSIFIER_SELECTION};

const HISTORY_SNIPPET: usize = 6;

/// LLM-driven agent selection with a keyword-overlap fallback that keeps
/// routing alive when the model is degraded.
pub struct Classifier {
    gateway: Arc<ModelGateway>,
    prompts: Arc<PromptStore>,
    params: ChatParams,
    keyword_overrides: RwLock<HashMap<String, Vec<String>>>,
}

#[derive(Deserialize)]
struct RawDecision {
    agents: Vec<String>,
    strategy: String,
    #[serde(default)]
    rationale: String,
}

impl Classifier {
    pub fn new(gateway: Arc<ModelGateway>, prompts: Arc<PromptStore>, params: ChatParams) -> Self {
        Self {
            gateway,
            prompts,
            params,
            keyword_overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the fallback keyword list for one agent.
    pub fn set_keywords(&self, agent: &str, keywords: Vec<String>) {
        self.keyword_overrides
            .write()
            .expect("keyword lock poisoned")
            .insert(agent.to_string(), keywords);
    }

    /// Never fails: unparseable or unavailable model output degrades to the
    /// keyword heuristic.
    pub async fn classify(
        &self,
        query: &str,
        history: &[Message],
        registry: &AgentRegistry,
    ) -> RoutingDecision {
        let prompt = match self.prompts.render(
            CLASSIFIER_SELECTION,
            &[
                ("agents", &registry.capability_lines()),
                ("history", &history_snippet(history)),
                ("query", query),
            ],
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("classifier template failed, using keyword fallback: {e}");
                return self.fallback(query, registry);
            }
        };

        let response = self
            .gateway
            .complete(vec![ChatMessage::user(prompt)], &self.params)
            .await;

        match response {
            Ok(response) => match parse_decision(&response.text, registry) {
                Some(decision) => decision,
                None => {
                    tracing::warn!(
                        "classifier returned unparseable output, using keyword fallback"
                    );
                    self.fallback(query, registry)
                }
            },
            Err(e) => {
                tracing::warn!("classifier call failed, using keyword fallback: {e}");
                self.fallback(query, registry)
            }
        }
    }

    /// Score each agent by keyword overlap with the query and return the
    /// top one with `strategy = single`, marked degraded.
    pub fn fallback(&self, query: &str, registry: &AgentRegistry) -> RoutingDecision {
        let query_words: Vec<String> = tokenize(query);
        let overrides = self.keyword_overrides.read().expect("keyword lock poisoned");

        let mut best: Option<(usize, String)> = None;
        for descriptor in registry.descriptors() {
            let keywords: Vec<String> = match overrides.get(&descriptor.name) {
                Some(extra) => extra.iter().map(|k| k.to_lowercase()).collect(),
                None => descriptor
                    .capabilities
                    .iter()
                    .map(|c| c.to_lowercase())
                    .collect(),
            };
            let score = query_words
                .iter()
                .filter(|word| keywords.iter().any(|k| k == *word))
                .count();
            match &best {
                Some((top, _)) if *top >= score => {}
                _ if score > 0 => best = Some((score, descriptor.name.clone())),
                _ => {}
            }
        }

        let agent = best
            .map(|(_, name)| name)
            .or_else(|| registry.names().first().cloned())
            .unwrap_or_default();

        RoutingDecision {
            agents: vec![agent],
            strategy: Strategy::Single,
            rationale: "keyword fallback".into(),
            degraded: true,
        }
    }
}

fn history_snippet(history: &[Message]) -> String {
    if history.is_empty() {
        return "(none)".into();
    }
    let start = history.len().saturating_sub(HISTORY_SNIPPET);
    history[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the model's routing object, tolerating markdown fences and prose
/// around the JSON. Unknown agents are dropped; an empty result is a parse
/// failure.
fn parse_decision(text: &str, registry: &AgentRegistry) -> Option<RoutingDecision> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawDecision = serde_json::from_str(&text[start..=end]).ok()?;

    let mut seen = std::collections::HashSet::new();
    let agents: Vec<String> = raw
        .agents
        .into_iter()
        .filter(|name| registry.get(name).is_some())
        .filter(|name| seen.insert(name.clone()))
        .collect();
    if agents.is_empty() {
        return None;
    }

    let strategy = match raw.strategy.as_str() {
        "single" => Strategy::Single,
        "parallel" => Strategy::Parallel,
        "collaborative" => Strategy::Collaborative,
        _ => return None,
    };

    // A one-agent decision is single regardless of the claimed strategy;
    // a single-strategy decision keeps only its first agent.
    let (agents, strategy) = match (agents.len(), strategy) {
        (1, _) => (agents, Strategy::Single),
        (_, Strategy::Single) => (vec![agents.into_iter().next().unwrap()], Strategy::Single),
        (_, s) => (agents, s),
    };

    Some(RoutingDecision {
        agents,
        strategy,
        rationale: raw.rationale,
        degraded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::default_registry;
    use crate::config::EngineConfig;
    use anyhow::Result;
    use async_trait::async_trait;
    use quorum_provider::{ChatClient, ChatRequest, ChatResponse};
    use std::sync::Mutex;

    struct CannedClient {
        reply: String,
        last_prompt: Mutex<String>,
    }

    impl CannedClient {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                last_prompt: Mutex::new(String::new()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for CannedClient {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
            *self.last_prompt.lock().unwrap() = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse {
                text: self.reply.clone(),
                stop_reason: Some("stop".into()),
                input_tokens: None,
                output_tokens: None,
            })
        }
    }

    struct DownClient;

    #[async_trait]
    impl ChatClient for DownClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse> {
            anyhow::bail!("model api error (503): provider down")
        }
    }

    fn setup(client: Arc<dyn ChatClient>) -> (Classifier, AgentRegistry) {
        let config = EngineConfig::default();
        let prompts = Arc::new(PromptStore::builtin());
        let gateway = Arc::new(ModelGateway::new(client));
        let registry = default_registry(prompts.clone(), gateway.clone(), &config);
        let classifier = Classifier::new(gateway, prompts, ChatParams::classifier(&config));
        (classifier, registry)
    }

    #[tokio::test]
    async fn parses_model_decision() {
        let client = Arc::new(CannedClient::new(
            r#"{"agents": ["engineer"], "strategy": "single", "rationale": "systems question"}"#,
        ));
        let (classifier, registry) = setup(client.clone());
        let decision = classifier
            .classify("Explain TCP slow start", &[], &registry)
            .await;
        assert_eq!(decision.agents, vec!["engineer"]);
        assert_eq!(decision.strategy, Strategy::Single);
        assert!(!decision.degraded);

        let prompt = client.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("Explain TCP slow start"));
        assert!(prompt.contains("- engineer:"));
    }

    #[tokio::test]
    async fn tolerates_markdown_fences() {
        let client = Arc::new(CannedClient::new(
            "```json\n{\"agents\": [\"engineer\", \"ethicist\"], \"strategy\": \"collaborative\", \"rationale\": \"r\"}\n```",
        ));
        let (classifier, registry) = setup(client);
        let decision = classifier.classify("design and critique", &[], &registry).await;
        assert_eq!(decision.agents, vec!["engineer", "ethicist"]);
        assert_eq!(decision.strategy, Strategy::Collaborative);
    }

    #[tokio::test]
    async fn unparseable_output_falls_back() {
        let client = Arc::new(CannedClient::new("I think the engineer should do it."));
        let (classifier, registry) = setup(client);
        let decision = classifier.classify("debug my code", &[], &registry).await;
        assert!(decision.degraded);
        assert_eq!(decision.strategy, Strategy::Single);
        assert_eq!(decision.agents, vec!["engineer"]);
    }

    #[tokio::test]
    async fn unknown_agents_trigger_fallback() {
        let client = Arc::new(CannedClient::new(
            r#"{"agents": ["wizard"], "strategy": "single", "rationale": "r"}"#,
        ));
        let (classifier, registry) = setup(client);
        let decision = classifier.classify("anything", &[], &registry).await;
        assert!(decision.degraded);
        assert!(!decision.agents.is_empty());
    }

    #[tokio::test]
    async fn model_failure_falls_back() {
        let (classifier, registry) = setup(Arc::new(DownClient));
        let decision = classifier
            .classify("summarize this research paper", &[], &registry)
            .await;
        assert!(decision.degraded);
        assert_eq!(decision.agents, vec!["researcher"]);
    }

    #[tokio::test]
    async fn fallback_defaults_when_nothing_matches() {
        let (classifier, registry) = setup(Arc::new(DownClient));
        let decision = classifier.classify("zzz qqq", &[], &registry).await;
        assert_eq!(decision.agents, vec!["engineer"], "first registered agent");
    }

    #[tokio::test]
    async fn keyword_overrides_steer_fallback() {
        let (classifier, registry) = setup(Arc::new(DownClient));
        classifier.set_keywords("ethicist", vec!["pineapple".into()]);
        let decision = classifier.classify("pineapple question", &[], &registry).await;
        assert_eq!(decision.agents, vec!["ethicist"]);
    }

    #[test]
    fn one_agent_collaborative_downgrades_to_single() {
        let config = EngineConfig::default();
        let prompts = Arc::new(PromptStore::builtin());
        let gateway = Arc::new(ModelGateway::new(Arc::new(DownClient)));
        let registry = default_registry(prompts, gateway, &config);
        let decision = parse_decision(
            r#"{"agents": ["engineer"], "strategy": "collaborative", "rationale": "r"}"#,
            &registry,
        )
        .unwrap();
        assert_eq!(decision.strategy, Strategy::Single);
    }

    #[test]
    fn single_strategy_keeps_first_agent_only() {
        let config = EngineConfig::default();
        let prompts = Arc::new(PromptStore::builtin());
        let gateway = Arc::new(ModelGateway::new(Arc::new(DownClient)));
        let registry = default_registry(prompts, gateway, &config);
        let decision = parse_decision(
            r#"{"agents": ["researcher", "engineer"], "strategy": "single", "rationale": "r"}"#,
            &registry,
        )
        .unwrap();
        assert_eq!(decision.agents, vec!["researcher"]);
    }

    #[test]
    fn duplicate_agents_are_deduplicated() {
        let config = EngineConfig::default();
        let prompts = Arc::new(PromptStore::builtin());
        let gateway = Arc::new(ModelGateway::new(Arc::new(DownClient)));
        let registry = default_registry(prompts, gateway, &config);
        let decision = parse_decision(
            r#"{"agents": ["engineer", "engineer", "ethicist"], "strategy": "parallel", "rationale": "r"}"#,
            &registry,
        )
        .unwrap();
        assert_eq!(decision.agents, vec!["engineer", "ethicist"]);
    }

    #[test]
    fn history_snippet_formats_roles() {
        let history = vec![
            Message::user("s", "q1"),
            Message::assistant("s", "engineer", "a1", 0.9),
        ];
        let snippet = history_snippet(&history);
        assert!(snippet.contains("user: q1"));
        assert!(snippet.contains("assistant: a1"));
        assert_eq!(history_snippet(&[]), "(none)");
    }
}
