use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use quorum_memory::{MemoryLayer, MemorySizes};
use quorum_schema::{
    AgentReply, AnswerRequest, AnswerResponse, Message, MemoryHit, RequestState,
    RoutingDecision, RoutingOverride, RunContext, Strategy, StreamEvent,
};

use crate::agent::AgentRegistry;
use crate::aggregator::{contributors_for, Aggregated, Aggregator};
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::decomposer::Decomposer;
use crate::error::{EngineError, EngineResult};
use crate::executor::Executor;
use crate::gateway::{ChatParams, ModelGateway};
use crate::prompts::{agent_system_template, PromptStore};
use crate::session_lock::SessionLockManager;

const DEFAULT_OWNER: &str = "default";
const HISTORY_WINDOW: usize = 20;
const MEMORY_HITS: usize = 6;
const WRITEBACK_IMPORTANCE: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Classifier,
    Keyword,
    Manual,
}

/// Operator-settable routing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub enable_collaboration: bool,
    pub enable_multi_agent: bool,
    pub routing_strategy: RoutingMode,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_collaboration: true,
            enable_multi_agent: true,
            routing_strategy: RoutingMode::Classifier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentConfigKind {
    Prompt,
    Keywords,
    Params,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub dispatches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub routing: RoutingConfig,
    pub agents: Vec<AgentStatus>,
    pub memory: MemorySizes,
}

/// Cancels the token when the request deadline passes; aborted on drop.
struct DeadlineGuard(tokio::task::JoinHandle<()>);

impl DeadlineGuard {
    fn spawn(token: CancellationToken, after: Duration) -> Self {
        Self(tokio::spawn(async move {
            time::sleep(after).await;
            token.cancel();
        }))
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The public entry point: classify, decompose, dispatch, aggregate,
/// persist. Constructed once at startup and shared.
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    classifier: Classifier,
    decomposer: Decomposer,
    executor: Executor,
    aggregator: Aggregator,
    memory: MemoryLayer,
    prompts: Arc<PromptStore>,
    gateway: Arc<ModelGateway>,
    session_locks: SessionLockManager,
    routing_config: RwLock<RoutingConfig>,
    pending_override: StdMutex<Option<RoutingOverride>>,
    dispatch_counts: StdMutex<HashMap<String, u64>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        registry: AgentRegistry,
        memory: MemoryLayer,
        gateway: Arc<ModelGateway>,
        prompts: Arc<PromptStore>,
    ) -> Self {
        let registry = Arc::new(registry);
        let classifier = Classifier::new(
            gateway.clone(),
            prompts.clone(),
            ChatParams::classifier(&config),
        );
        let decomposer = Decomposer::new(
            gateway.clone(),
            prompts.clone(),
            ChatParams::classifier(&config),
        );
        let executor = Executor::new(
            registry.clone(),
            config.max_concurrent_agents,
            config.agent_timeout,
        );
        let aggregator = Aggregator::new(
            gateway.clone(),
            prompts.clone(),
            ChatParams::agent(&config),
        );
        Self {
            config,
            registry,
            classifier,
            decomposer,
            executor,
            aggregator,
            memory,
            prompts,
            gateway,
            session_locks: SessionLockManager::new(),
            routing_config: RwLock::new(RoutingConfig::default()),
            pending_override: StdMutex::new(None),
            dispatch_counts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &MemoryLayer {
        &self.memory
    }

    pub async fn gateway_ready(&self) -> bool {
        self.gateway.health().await
    }

    // ============================================================
    // Control surface
    // ============================================================

    /// Install a one-shot routing override consumed by the next answer
    /// call. Unknown agent names are rejected.
    pub fn set_override(&self, routing_override: RoutingOverride) -> EngineResult<()> {
        if routing_override.agents.is_empty() && !routing_override.force_all {
            return Err(EngineError::BadRequest(
                "override must list agents or set force_all".into(),
            ));
        }
        for name in &routing_override.agents {
            if self.registry.get(name).is_none() {
                return Err(EngineError::BadRequest(format!("unknown agent: {name}")));
            }
        }
        *self
            .pending_override
            .lock()
            .expect("override lock poisoned") = Some(routing_override);
        Ok(())
    }

    pub fn routing_config(&self) -> RoutingConfig {
        self.routing_config
            .read()
            .expect("routing config lock poisoned")
            .clone()
    }

    pub fn set_routing_config(&self, config: RoutingConfig) {
        *self
            .routing_config
            .write()
            .expect("routing config lock poisoned") = config;
    }

    pub fn update_agent_config(
        &self,
        agent_name: &str,
        kind: AgentConfigKind,
        data: serde_json::Value,
        persist: bool,
    ) -> EngineResult<()> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| EngineError::BadRequest(format!("unknown agent: {agent_name}")))?;

        match kind {
            AgentConfigKind::Prompt => {
                let body = data
                    .as_str()
                    .ok_or_else(|| {
                        EngineError::BadRequest("prompt config_data must be a string".into())
                    })?
                    .to_string();
                let template_id = agent_system_template(agent_name);
                if persist {
                    if let Some(dir) = &self.config.prompt_dir {
                        let path = dir.join(format!("{template_id}.txt"));
                        std::fs::write(&path, &body).map_err(|e| {
                            EngineError::Storage(format!("write {}: {e}", path.display()))
                        })?;
                    }
                }
                self.prompts.insert(&template_id, body);
            }
            AgentConfigKind::Keywords => {
                let keywords: Vec<String> = serde_json::from_value(data).map_err(|_| {
                    EngineError::BadRequest("keywords config_data must be a string array".into())
                })?;
                self.classifier.set_keywords(agent_name, keywords);
            }
            AgentConfigKind::Params => {
                let temperature = data.get("temperature").and_then(|v| v.as_f64());
                let max_tokens = data.get("max_tokens").and_then(|v| v.as_u64());
                agent.apply_params(
                    temperature.map(|t| t as f32),
                    max_tokens.map(|m| m as u32),
                );
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> EngineResult<StatusReport> {
        let counts = self
            .dispatch_counts
            .lock()
            .expect("dispatch counts lock poisoned")
            .clone();
        let agents = self
            .registry
            .names()
            .into_iter()
            .map(|name| {
                let dispatches = counts.get(&name).copied().unwrap_or(0);
                AgentStatus { name, dispatches }
            })
            .collect();
        let memory = self.memory.sizes().await.map_err(EngineError::storage)?;
        Ok(StatusReport {
            routing: self.routing_config(),
            agents,
            memory,
        })
    }

    // ============================================================
    // Answer (unary)
    // ============================================================

    pub async fn answer(&self, request: AnswerRequest) -> EngineResult<AnswerResponse> {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let _deadline = DeadlineGuard::spawn(cancel.clone(), self.config.request_timeout);

        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(EngineError::BadRequest("query must not be empty".into()));
        }

        let session_id = self.acquire_session(&request).await?;
        let _guard = self.session_locks.acquire(&session_id).await;

        let user_msg = Message::user(&session_id, &query);
        self.memory
            .sessions()
            .append(&user_msg)
            .await
            .map_err(EngineError::storage)?;

        let result = self
            .execute(&query, &session_id, &user_msg, request.overrides, &cancel, started)
            .await;
        if let Err(ref err) = result {
            self.maybe_append_failure_marker(&session_id, err).await;
        }
        result
    }

    async fn execute(
        &self,
        query: &str,
        session_id: &str,
        user_msg: &Message,
        request_override: Option<RoutingOverride>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> EngineResult<AnswerResponse> {
        trace_state(session_id, RequestState::Received);
        let (history, memory_hits) = self.gather_context(query, session_id, user_msg).await;
        let mut routing = self
            .resolve_routing(query, &history, request_override)
            .await?;
        trace_state(session_id, RequestState::Classified);

        if cancel.is_cancelled() {
            trace_state(session_id, RequestState::Cancelled);
            return Err(EngineError::Cancelled);
        }

        let mut ctx = RunContext {
            query: query.to_string(),
            session_id: session_id.to_string(),
            history,
            memory_hits,
            routing: None,
            task_graph: None,
            partial_outputs: Default::default(),
        };

        trace_state(session_id, RequestState::Dispatched);
        let replies = self.dispatch(&mut ctx, &mut routing, cancel).await?;

        if replies.iter().all(|r| r.confidence == 0.0) {
            trace_state(session_id, RequestState::Failed);
            return Err(EngineError::ModelUnavailable(
                "all dispatched agents failed".into(),
            ));
        }

        trace_state(session_id, RequestState::Aggregating);
        let aggregated = self.aggregator.aggregate(query, &replies).await?;

        if cancel.is_cancelled() {
            trace_state(session_id, RequestState::Cancelled);
            return Err(EngineError::Cancelled);
        }

        self.persist_replies(session_id, &replies, &aggregated)
            .await?;
        trace_state(session_id, RequestState::Persisted);
        self.write_back(query, &aggregated.content).await;
        trace_state(session_id, RequestState::Done);

        Ok(AnswerResponse {
            content: aggregated.content,
            contributors: aggregated.contributors,
            session_id: session_id.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            degraded: routing.degraded,
        })
    }

    // ============================================================
    // Answer (streaming)
    // ============================================================

    /// Streaming variant: progress markers while agents run, then the
    /// final reply as chunks. The last event is always `done`. Dropping
    /// the stream cancels upstream work; nothing is persisted until the
    /// final text is complete.
    pub fn answer_stream(
        self: Arc<Self>,
        request: AnswerRequest,
    ) -> impl Stream<Item = StreamEvent> + Send {
        async_stream::stream! {
            let started = Instant::now();
            let cancel = CancellationToken::new();
            let _deadline = DeadlineGuard::spawn(cancel.clone(), self.config.request_timeout);

            let query = request.query.trim().to_string();
            if query.is_empty() {
                yield error_event(&EngineError::BadRequest("query must not be empty".into()));
                yield StreamEvent::Done { cancelled: false };
                return;
            }

            let session_id = match self.acquire_session(&request).await {
                Ok(id) => id,
                Err(e) => {
                    yield error_event(&e);
                    yield StreamEvent::Done { cancelled: false };
                    return;
                }
            };
            let _guard = self.session_locks.acquire(&session_id).await;

            let user_msg = Message::user(&session_id, &query);
            if let Err(e) = self.memory.sessions().append(&user_msg).await {
                yield error_event(&EngineError::storage(e));
                yield StreamEvent::Done { cancelled: false };
                return;
            }

            let (history, memory_hits) = self.gather_context(&query, &session_id, &user_msg).await;
            let mut routing = match self
                .resolve_routing(&query, &history, request.overrides)
                .await
            {
                Ok(routing) => routing,
                Err(e) => {
                    self.maybe_append_failure_marker(&session_id, &e).await;
                    yield error_event(&e);
                    yield StreamEvent::Done { cancelled: false };
                    return;
                }
            };

            yield StreamEvent::Progress { stage: "classified".into(), agent: None };
            if cancel.is_cancelled() {
                yield StreamEvent::Done { cancelled: true };
                return;
            }

            let mut ctx = RunContext {
                query: query.clone(),
                session_id: session_id.clone(),
                history,
                memory_hits,
                routing: None,
                task_graph: None,
                partial_outputs: Default::default(),
            };

            // Single-agent runs stream the agent's own completion.
            if routing.strategy == Strategy::Single {
                let agent_name = routing.agents[0].clone();
                yield StreamEvent::Progress { stage: "dispatched".into(), agent: Some(agent_name.clone()) };
                self.count_dispatches(&[agent_name.clone()]);

                let agent = match self.registry.get(&agent_name) {
                    Some(agent) => agent,
                    None => {
                        let e = EngineError::BadRequest(format!("unknown agent: {agent_name}"));
                        yield error_event(&e);
                        yield StreamEvent::Done { cancelled: false };
                        return;
                    }
                };

                let mut upstream = match agent.process_stream(&ctx).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let e = EngineError::ModelUnavailable(e.to_string());
                        self.maybe_append_failure_marker(&session_id, &e).await;
                        yield error_event(&e);
                        yield StreamEvent::Done { cancelled: false };
                        return;
                    }
                };

                let mut content = String::new();
                loop {
                    if cancel.is_cancelled() {
                        yield StreamEvent::Done { cancelled: true };
                        return;
                    }
                    match upstream.next().await {
                        Some(Ok(chunk)) if chunk.done => break,
                        Some(Ok(chunk)) => {
                            content.push_str(&chunk.delta);
                            yield StreamEvent::Chunk { content: chunk.delta };
                        }
                        Some(Err(e)) => {
                            let e = EngineError::ModelUnavailable(e.to_string());
                            yield error_event(&e);
                            yield StreamEvent::Done { cancelled: false };
                            return;
                        }
                        None => break,
                    }
                }

                yield StreamEvent::AgentComplete { agent: agent_name.clone() };

                let reply = AgentReply {
                    agent: agent_name,
                    content,
                    confidence: 0.8,
                };
                let aggregated = Aggregated {
                    content: reply.content.clone(),
                    contributors: contributors_for(&[reply.clone()], &reply.content),
                    synthesized: false,
                };
                if let Err(e) = self.persist_replies(&session_id, &[reply], &aggregated).await {
                    yield error_event(&e);
                    yield StreamEvent::Done { cancelled: false };
                    return;
                }
                self.write_back(&query, &aggregated.content).await;
                yield StreamEvent::Done { cancelled: false };
                return;
            }

            // Multi-agent runs: agents complete first, then the synthesis
            // call streams.
            yield StreamEvent::Progress { stage: "dispatched".into(), agent: None };
            let replies = match self.dispatch(&mut ctx, &mut routing, &cancel).await {
                Ok(replies) => replies,
                Err(EngineError::Cancelled) => {
                    yield StreamEvent::Done { cancelled: true };
                    return;
                }
                Err(e) => {
                    self.maybe_append_failure_marker(&session_id, &e).await;
                    yield error_event(&e);
                    yield StreamEvent::Done { cancelled: false };
                    return;
                }
            };

            for reply in &replies {
                yield StreamEvent::AgentComplete { agent: reply.agent.clone() };
            }

            if replies.iter().all(|r| r.confidence == 0.0) {
                let e = EngineError::ModelUnavailable("all dispatched agents failed".into());
                self.maybe_append_failure_marker(&session_id, &e).await;
                yield error_event(&e);
                yield StreamEvent::Done { cancelled: false };
                return;
            }

            let mut content = String::new();
            let mut synthesized = true;
            if replies.len() == 1 {
                content = replies[0].content.clone();
                synthesized = false;
                yield StreamEvent::Chunk { content: content.clone() };
            } else {
                match self.aggregator.open_stream(&query, &replies).await {
                    Ok(mut upstream) => loop {
                        if cancel.is_cancelled() {
                            yield StreamEvent::Done { cancelled: true };
                            return;
                        }
                        match upstream.next().await {
                            Some(Ok(chunk)) if chunk.done => break,
                            Some(Ok(chunk)) => {
                                content.push_str(&chunk.delta);
                                yield StreamEvent::Chunk { content: chunk.delta };
                            }
                            Some(Err(e)) => {
                                let e = EngineError::ModelUnavailable(e.to_string());
                                yield error_event(&e);
                                yield StreamEvent::Done { cancelled: false };
                                return;
                            }
                            None => break,
                        }
                    },
                    Err(e) => {
                        self.maybe_append_failure_marker(&session_id, &e).await;
                        yield error_event(&e);
                        yield StreamEvent::Done { cancelled: false };
                        return;
                    }
                }
            }

            if cancel.is_cancelled() {
                yield StreamEvent::Done { cancelled: true };
                return;
            }

            let aggregated = Aggregated {
                contributors: contributors_for(&replies, &content),
                content,
                synthesized,
            };
            if let Err(e) = self.persist_replies(&session_id, &replies, &aggregated).await {
                yield error_event(&e);
                yield StreamEvent::Done { cancelled: false };
                return;
            }
            self.write_back(&query, &aggregated.content).await;
            tracing::debug!(
                session = %session_id,
                duration_ms = started.elapsed().as_millis() as u64,
                "streamed answer complete"
            );
            yield StreamEvent::Done { cancelled: false };
        }
    }

    // ============================================================
    // Pipeline stages
    // ============================================================

    async fn acquire_session(&self, request: &AnswerRequest) -> EngineResult<String> {
        let session = match &request.session_id {
            Some(id) => self
                .memory
                .sessions()
                .get_or_create(id, DEFAULT_OWNER)
                .await
                .map_err(EngineError::storage)?,
            None => self
                .memory
                .sessions()
                .create(DEFAULT_OWNER, None)
                .await
                .map_err(EngineError::storage)?,
        };
        Ok(session.id)
    }

    /// History and memory hits; both degrade to empty on store failures.
    async fn gather_context(
        &self,
        query: &str,
        session_id: &str,
        user_msg: &Message,
    ) -> (Vec<Message>, Vec<MemoryHit>) {
        let history = match self
            .memory
            .recent_conversation(session_id, HISTORY_WINDOW)
            .await
        {
            Ok(messages) => messages
                .into_iter()
                .filter(|m| m.id != user_msg.id)
                .collect(),
            Err(e) => {
                tracing::warn!("history load failed, proceeding with empty history: {e}");
                Vec::new()
            }
        };
        let memory_hits = self.memory.search_all(query, MEMORY_HITS).await;
        (history, memory_hits)
    }

    /// Override > classifier > fallback, then operator routing constraints.
    async fn resolve_routing(
        &self,
        query: &str,
        history: &[Message],
        request_override: Option<RoutingOverride>,
    ) -> EngineResult<RoutingDecision> {
        let pending = self
            .pending_override
            .lock()
            .expect("override lock poisoned")
            .take();

        if let Some(routing_override) = request_override.or(pending) {
            return self.decision_from_override(routing_override);
        }

        let mode = self.routing_config().routing_strategy;
        let mut decision = match mode {
            RoutingMode::Classifier => self.classifier.classify(query, history, &self.registry).await,
            RoutingMode::Keyword => {
                let mut decision = self.classifier.fallback(query, &self.registry);
                decision.degraded = false; // operator chose this path
                decision
            }
            RoutingMode::Manual => {
                let agent = self
                    .registry
                    .default_agent()
                    .ok_or_else(|| EngineError::BadRequest("no agents registered".into()))?;
                RoutingDecision {
                    agents: vec![agent.name().to_string()],
                    strategy: Strategy::Single,
                    rationale: "manual routing".into(),
                    degraded: false,
                }
            }
        };

        let config = self.routing_config();
        if !config.enable_multi_agent && decision.agents.len() > 1 {
            decision.agents.truncate(1);
            decision.strategy = Strategy::Single;
        }
        if decision.strategy == Strategy::Collaborative && !config.enable_collaboration {
            decision.strategy = Strategy::Parallel;
        }
        Ok(decision)
    }

    fn decision_from_override(
        &self,
        routing_override: RoutingOverride,
    ) -> EngineResult<RoutingDecision> {
        for name in &routing_override.agents {
            if self.registry.get(name).is_none() {
                return Err(EngineError::BadRequest(format!("unknown agent: {name}")));
            }
        }
        let (agents, strategy) = if routing_override.force_all {
            (self.registry.names(), Strategy::Parallel)
        } else if routing_override.agents.is_empty() {
            return Err(EngineError::BadRequest(
                "override must list agents or set force_all".into(),
            ));
        } else if routing_override.force_single || routing_override.agents.len() == 1 {
            (
                vec![routing_override.agents[0].clone()],
                Strategy::Single,
            )
        } else {
            let mut seen = std::collections::HashSet::new();
            let agents: Vec<String> = routing_override
                .agents
                .into_iter()
                .filter(|name| seen.insert(name.clone()))
                .collect();
            (agents, Strategy::Parallel)
        };
        Ok(RoutingDecision {
            agents,
            strategy,
            rationale: "operator override".into(),
            degraded: false,
        })
    }

    async fn dispatch(
        &self,
        ctx: &mut RunContext,
        routing: &mut RoutingDecision,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<AgentReply>> {
        // Collaborative runs need a task graph first; failure to plan
        // degrades to single-agent routing.
        if routing.strategy == Strategy::Collaborative {
            match self.decomposer.decompose(&ctx.query, &self.registry).await {
                Some(graph) => {
                    trace_state(&ctx.session_id, RequestState::Decomposed);
                    let agents: Vec<String> =
                        graph.nodes.iter().map(|n| n.agent.clone()).collect();
                    self.count_dispatches(&agents);
                    ctx.routing = Some(routing.clone());
                    return self.executor.run_graph(ctx, graph, cancel).await;
                }
                None => {
                    routing.agents.truncate(1);
                    routing.strategy = Strategy::Single;
                    routing.degraded = true;
                }
            }
        }
        ctx.routing = Some(routing.clone());

        match routing.strategy {
            Strategy::Single => {
                let agent_name = routing.agents[0].clone();
                self.count_dispatches(&[agent_name.clone()]);
                let reply = self.run_single(ctx, &agent_name, cancel).await?;
                Ok(vec![reply])
            }
            _ => {
                self.count_dispatches(&routing.agents);
                self.executor.run_parallel(ctx, &routing.agents, cancel).await
            }
        }
    }

    /// Direct call path: one agent, no executor. A failure here means every
    /// dispatched agent failed.
    async fn run_single(
        &self,
        ctx: &RunContext,
        agent_name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<AgentReply> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| EngineError::BadRequest(format!("unknown agent: {agent_name}")))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = time::timeout(self.config.agent_timeout, agent.process(ctx)) => match result {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e @ (EngineError::Cancelled
                    | EngineError::BadRequest(_)
                    | EngineError::ConsistencyViolation(_)))) => Err(e),
                Ok(Err(e)) => Err(EngineError::ModelUnavailable(e.to_string())),
                Err(_) => Err(EngineError::ModelUnavailable(format!(
                    "agent {agent_name} timed out after {:?}",
                    self.config.agent_timeout
                ))),
            },
        }
    }

    /// Raw attribution goes to the log: one message per contributing agent,
    /// then the aggregator's synthesis when one was produced.
    async fn persist_replies(
        &self,
        session_id: &str,
        replies: &[AgentReply],
        aggregated: &Aggregated,
    ) -> EngineResult<()> {
        if aggregated.synthesized {
            for reply in replies {
                let msg = Message::assistant(session_id, &reply.agent, &reply.content, reply.confidence);
                self.memory
                    .sessions()
                    .append(&msg)
                    .await
                    .map_err(EngineError::storage)?;
            }
            let confidence = mean_confidence(replies);
            let msg = Message::assistant(session_id, "aggregator", &aggregated.content, confidence);
            self.memory
                .sessions()
                .append(&msg)
                .await
                .map_err(EngineError::storage)?;
        } else {
            let reply = &replies[0];
            let msg = Message::assistant(session_id, &reply.agent, &aggregated.content, reply.confidence);
            self.memory
                .sessions()
                .append(&msg)
                .await
                .map_err(EngineError::storage)?;
        }
        Ok(())
    }

    /// Post-response memory enrichment; failures only warn.
    async fn write_back(&self, query: &str, content: &str) {
        let tags: BTreeSet<String> = ["conversation".to_string()].into_iter().collect();
        let text = format!("Q: {query}\nA: {content}");
        if let Err(e) = self.memory.remember(text, tags, WRITEBACK_IMPORTANCE).await {
            tracing::warn!("memory write-back failed: {e}");
        }
    }

    async fn maybe_append_failure_marker(&self, session_id: &str, err: &EngineError) {
        if !self.config.append_failure_marker || matches!(err, EngineError::Cancelled) {
            return;
        }
        let marker = Message::assistant(
            session_id,
            "system",
            format!("[request failed: {}]", err.code()),
            0.0,
        );
        if let Err(e) = self.memory.sessions().append(&marker).await {
            tracing::warn!("failed to append failure marker: {e}");
        }
    }

    fn count_dispatches<S: AsRef<str>>(&self, agents: &[S]) {
        let mut counts = self
            .dispatch_counts
            .lock()
            .expect("dispatch counts lock poisoned");
        for agent in agents {
            *counts.entry(agent.as_ref().to_string()).or_insert(0) += 1;
        }
    }
}

fn trace_state(session_id: &str, state: RequestState) {
    tracing::debug!(session = %session_id, state = ?state, "request state");
}

fn mean_confidence(replies: &[AgentReply]) -> f32 {
    let usable: Vec<f32> = replies
        .iter()
        .filter(|r| r.confidence > 0.0)
        .map(|r| r.confidence)
        .collect();
    if usable.is_empty() {
        return 0.0;
    }
    usable.iter().sum::<f32>() / usable.len() as f32
}

fn error_event(err: &EngineError) -> StreamEvent {
    StreamEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}
