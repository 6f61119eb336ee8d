use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use quorum_provider::{ChatMessage, ChunkStream};
use quorum_schema::{AgentDescriptor, AgentReply, MemoryHit, Role, RunContext};

use crate::config::EngineConfig;
use crate::context::truncate_history;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{ChatParams, ModelGateway};
use crate::prompts::{agent_system_template, PromptStore};

const DEFAULT_CONFIDENCE: f32 = 0.8;
const EMPTY_REPLY_CONFIDENCE: f32 = 0.1;
const DEFAULT_HISTORY_PAIRS: usize = 5;
const HISTORY_TOKEN_BUDGET: usize = 4000;

/// Capability contract every specialist implements. Concrete agents differ
/// in their template and capability set; the framework is open to
/// registration of additional implementations under unique names.
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.descriptor().capabilities.clone()
    }

    async fn process(&self, ctx: &RunContext) -> EngineResult<AgentReply>;

    async fn process_stream(&self, ctx: &RunContext) -> EngineResult<ChunkStream>;

    /// Control-surface hook for live parameter tweaks.
    fn apply_params(&self, _temperature: Option<f32>, _max_tokens: Option<u32>) {}
}

/// Template-driven agent: system prompt, memory block, recent history,
/// then the query, sent through the gateway.
pub struct SpecialistAgent {
    descriptor: AgentDescriptor,
    prompts: Arc<PromptStore>,
    gateway: Arc<ModelGateway>,
    params: RwLock<ChatParams>,
    history_pairs: usize,
}

impl SpecialistAgent {
    pub fn new(
        descriptor: AgentDescriptor,
        prompts: Arc<PromptStore>,
        gateway: Arc<ModelGateway>,
        params: ChatParams,
    ) -> Self {
        Self {
            descriptor,
            prompts,
            gateway,
            params: RwLock::new(params),
            history_pairs: DEFAULT_HISTORY_PAIRS,
        }
    }

    fn compose_messages(&self, ctx: &RunContext) -> EngineResult<Vec<ChatMessage>> {
        let mut system = self
            .prompts
            .render(&self.descriptor.prompt_template_id, &[])?;

        if !ctx.memory_hits.is_empty() {
            system.push_str("\n\n## Relevant memory\n");
            system.push_str(&memory_block(&ctx.memory_hits));
        }

        let mut messages = vec![ChatMessage::system(system)];

        let window = ctx
            .history
            .len()
            .saturating_sub(self.history_pairs * 2);
        let recent = truncate_history(&ctx.history[window..], HISTORY_TOKEN_BUDGET);
        for msg in recent {
            match msg.role {
                Role::User => messages.push(ChatMessage::user(msg.content.clone())),
                Role::Assistant => messages.push(ChatMessage::assistant(msg.content.clone())),
                Role::System => {}
            }
        }

        messages.push(ChatMessage::user(ctx.query.clone()));
        Ok(messages)
    }

    fn current_params(&self) -> ChatParams {
        self.params.read().expect("agent params lock poisoned").clone()
    }
}

#[async_trait]
impl Agent for SpecialistAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, ctx: &RunContext) -> EngineResult<AgentReply> {
        let messages = self.compose_messages(ctx)?;
        let response = self.gateway.complete(messages, &self.current_params()).await?;
        let confidence = if response.text.trim().is_empty() {
            EMPTY_REPLY_CONFIDENCE
        } else {
            DEFAULT_CONFIDENCE
        };
        Ok(AgentReply {
            agent: self.descriptor.name.clone(),
            content: response.text,
            confidence,
        })
    }

    async fn process_stream(&self, ctx: &RunContext) -> EngineResult<ChunkStream> {
        let messages = self.compose_messages(ctx)?;
        self.gateway.stream(messages, &self.current_params()).await
    }

    fn apply_params(&self, temperature: Option<f32>, max_tokens: Option<u32>) {
        let mut params = self.params.write().expect("agent params lock poisoned");
        if let Some(t) = temperature {
            params.temperature = t;
        }
        if let Some(m) = max_tokens {
            params.max_tokens = m;
        }
    }
}

fn memory_block(hits: &[MemoryHit]) -> String {
    hits.iter()
        .map(|hit| format!("- [{:?} {:.2}] {}", hit.kind, hit.score, hit.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Registration table keyed by unique agent name, preserving registration
/// order. The first registered agent is the routing fallback default.
#[derive(Default)]
pub struct AgentRegistry {
    order: Vec<String>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> EngineResult<()> {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) {
            return Err(EngineError::BadRequest(format!(
                "agent already registered: {name}"
            )));
        }
        self.order.push(name.clone());
        self.agents.insert(name, agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn default_agent(&self) -> Option<Arc<dyn Agent>> {
        self.order.first().and_then(|name| self.get(name))
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.agents.get(name))
            .map(|agent| agent.descriptor().clone())
            .collect()
    }

    /// One line per agent for the classifier/decomposer templates.
    pub fn capability_lines(&self) -> String {
        self.descriptors()
            .iter()
            .map(|d| {
                format!(
                    "- {}: {}",
                    d.name,
                    d.capabilities.iter().cloned().collect::<Vec<_>>().join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn descriptor(name: &str, capabilities: &[&str]) -> AgentDescriptor {
    AgentDescriptor {
        name: name.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        prompt_template_id: agent_system_template(name),
        active: true,
    }
}

/// The three shipped specialists.
pub fn default_registry(
    prompts: Arc<PromptStore>,
    gateway: Arc<ModelGateway>,
    config: &EngineConfig,
) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    let descriptors = [
        descriptor(
            "engineer",
            &[
                "software", "architecture", "code", "protocol", "network", "design",
                "performance", "infrastructure", "debugging", "api",
            ],
        ),
        descriptor(
            "researcher",
            &[
                "research", "retrieval", "summarize", "information", "facts", "compare",
                "sources", "explain", "background",
            ],
        ),
        descriptor(
            "ethicist",
            &[
                "ethics", "critique", "risk", "safety", "tradeoffs", "fairness",
                "privacy", "review", "bias",
            ],
        ),
    ];
    for descriptor in descriptors {
        let agent = SpecialistAgent::new(
            descriptor,
            prompts.clone(),
            gateway.clone(),
            ChatParams::agent(config),
        );
        registry
            .register(Arc::new(agent))
            .expect("default agent names are unique");
    }
    registry
}
