use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;

use quorum_schema::{AgentReply, RunContext, TaskGraph};

use crate::agent::AgentRegistry;
use crate::decomposer::topo_layers;
use crate::error::{EngineError, EngineResult};

/// Runs selected agents either as an unordered concurrent fan-out
/// (`parallel`) or as a dependency-ordered task graph (`collaborative`).
/// Model-call concurrency is capped by a FIFO semaphore; failed or
/// timed-out agents degrade to a synthetic zero-confidence note instead of
/// failing the run.
pub struct Executor {
    registry: Arc<AgentRegistry>,
    semaphore: Arc<Semaphore>,
    agent_timeout: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        max_concurrent: Option<usize>,
        agent_timeout: Duration,
    ) -> Self {
        let ceiling = max_concurrent.unwrap_or_else(|| registry.len()).max(1);
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(ceiling)),
            agent_timeout,
        }
    }

    /// All agents at once, no dependencies. Replies come back in the
    /// declared order, not completion order.
    pub async fn run_parallel(
        &self,
        ctx: &RunContext,
        agents: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<AgentReply>> {
        let futures: Vec<_> = agents
            .iter()
            .map(|name| self.run_one(name.clone(), ctx.clone()))
            .collect();

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            replies = futures::future::join_all(futures) => Ok(replies),
        }
    }

    /// Execute the task DAG in topological layers. Within a layer tasks run
    /// concurrently; between layers completed outputs are materialized into
    /// `ctx.partial_outputs` and become visible to dependents.
    pub async fn run_graph(
        &self,
        ctx: &mut RunContext,
        mut graph: TaskGraph,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<AgentReply>> {
        let layers = topo_layers(&graph)?;
        let mut replies: Vec<Option<AgentReply>> = vec![None; graph.len()];

        for layer in layers {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut prepared = Vec::with_capacity(layer.len());
            for &idx in &layer {
                let node = &graph.nodes[idx];
                for &dep in &node.depends_on {
                    if !ctx.partial_outputs.contains_key(&dep) {
                        return Err(EngineError::ConsistencyViolation(format!(
                            "task {idx} scheduled before dependency {dep} completed"
                        )));
                    }
                }
                prepared.push((idx, node.agent.clone(), task_context(ctx, &graph, idx)));
            }

            let futures: Vec<_> = prepared
                .into_iter()
                .map(|(idx, agent, task_ctx)| async move {
                    (idx, self.run_one(agent, task_ctx).await)
                })
                .collect();

            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                results = futures::future::join_all(futures) => results,
            };

            for (idx, reply) in results {
                ctx.partial_outputs.insert(idx, reply.content.clone());
                graph.nodes[idx].output = Some(reply.content.clone());
                replies[idx] = Some(reply);
            }
        }

        ctx.task_graph = Some(graph);
        Ok(replies.into_iter().flatten().collect())
    }

    async fn run_one(&self, agent_name: String, ctx: RunContext) -> AgentReply {
        let Some(agent) = self.registry.get(&agent_name) else {
            return failure_reply(&agent_name, "not registered");
        };

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore closed");

        let result = time::timeout(self.agent_timeout, agent.process(&ctx)).await;
        drop(permit);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("agent {agent_name} failed, degrading: {e}");
                failure_reply(&agent_name, &e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    "agent {agent_name} timed out after {:?}, degrading",
                    self.agent_timeout
                );
                failure_reply(&agent_name, "timed out")
            }
        }
    }
}

/// A failed agent's contribution: low-confidence note the aggregator treats
/// as unusable input.
fn failure_reply(agent: &str, reason: &str) -> AgentReply {
    AgentReply {
        agent: agent.to_string(),
        content: format!("[{agent} unavailable: {reason}]"),
        confidence: 0.0,
    }
}

/// Per-task context: the node's input plus the outputs of its dependencies.
fn task_context(ctx: &RunContext, graph: &TaskGraph, idx: usize) -> RunContext {
    let node = &graph.nodes[idx];
    let mut query = node.input.clone();
    if !node.depends_on.is_empty() {
        query.push_str("\n\n## Outputs from earlier tasks\n");
        for &dep in &node.depends_on {
            let output = ctx
                .partial_outputs
                .get(&dep)
                .map(String::as_str)
                .unwrap_or("(missing)");
            query.push_str(&format!("### {} (task {dep})\n{output}\n", graph.nodes[dep].agent));
        }
    }

    let mut task_ctx = ctx.clone();
    task_ctx.query = query;
    task_ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineResult;
    use async_trait::async_trait;
    use quorum_provider::{ChunkStream, StreamChunk};
    use quorum_schema::{AgentDescriptor, TaskNode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::agent::Agent;

    struct FakeAgent {
        descriptor: AgentDescriptor,
        delay: Duration,
        fail: bool,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl FakeAgent {
        fn new(name: &str) -> Self {
            Self {
                descriptor: AgentDescriptor {
                    name: name.to_string(),
                    capabilities: Default::default(),
                    prompt_template_id: format!("agent.{name}.system"),
                    active: true,
                },
                delay: Duration::from_millis(0),
                fail: false,
                running: Arc::new(AtomicUsize::new(0)),
                max_running: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn with_counters(mut self, running: Arc<AtomicUsize>, max: Arc<AtomicUsize>) -> Self {
            self.running = running;
            self.max_running = max;
            self
        }
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn process(&self, ctx: &RunContext) -> EngineResult<AgentReply> {
            let inside = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(inside, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(EngineError::ModelUnavailable("boom".into()));
            }
            Ok(AgentReply {
                agent: self.descriptor.name.clone(),
                content: format!("{}=>{}", self.descriptor.name, ctx.query),
                confidence: 0.8,
            })
        }

        async fn process_stream(&self, ctx: &RunContext) -> EngineResult<ChunkStream> {
            let reply = self.process(ctx).await?;
            Ok(Box::pin(tokio_stream::iter(vec![
                Ok(StreamChunk::delta(reply.content)),
                Ok(StreamChunk::done(None)),
            ])))
        }
    }

    fn registry_of(agents: Vec<FakeAgent>) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(Arc::new(agent)).unwrap();
        }
        Arc::new(registry)
    }

    fn ctx(query: &str) -> RunContext {
        RunContext {
            query: query.to_string(),
            session_id: "s1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parallel_preserves_declared_order() {
        let registry = registry_of(vec![
            FakeAgent::new("slow").with_delay(Duration::from_millis(50)),
            FakeAgent::new("fast"),
        ]);
        let executor = Executor::new(registry, None, Duration::from_secs(5));
        let replies = executor
            .run_parallel(
                &ctx("q"),
                &["slow".into(), "fast".into()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(replies[0].agent, "slow");
        assert_eq!(replies[1].agent, "fast");
    }

    #[tokio::test]
    async fn concurrency_ceiling_is_enforced() {
        let running = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let agents: Vec<FakeAgent> = (0..6)
            .map(|i| {
                FakeAgent::new(&format!("a{i}"))
                    .with_delay(Duration::from_millis(20))
                    .with_counters(running.clone(), max.clone())
            })
            .collect();
        let registry = registry_of(agents);
        let executor = Executor::new(registry, Some(2), Duration::from_secs(5));

        let names: Vec<String> = (0..6).map(|i| format!("a{i}")).collect();
        executor
            .run_parallel(&ctx("q"), &names, &CancellationToken::new())
            .await
            .unwrap();
        assert!(max.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failed_agent_degrades_to_low_confidence_note() {
        let registry = registry_of(vec![
            FakeAgent::new("good"),
            FakeAgent::new("bad").failing(),
        ]);
        let executor = Executor::new(registry, None, Duration::from_secs(5));
        let replies = executor
            .run_parallel(
                &ctx("q"),
                &["good".into(), "bad".into()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(replies[0].confidence, 0.8);
        assert_eq!(replies[1].confidence, 0.0);
        assert!(replies[1].content.contains("bad unavailable"));
    }

    #[tokio::test]
    async fn timed_out_agent_degrades() {
        let registry = registry_of(vec![
            FakeAgent::new("sleepy").with_delay(Duration::from_secs(60)),
        ]);
        let executor = Executor::new(registry, None, Duration::from_millis(30));
        let replies = executor
            .run_parallel(&ctx("q"), &["sleepy".into()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(replies[0].confidence, 0.0);
        assert!(replies[0].content.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_run() {
        let registry = registry_of(vec![
            FakeAgent::new("sleepy").with_delay(Duration::from_secs(60)),
        ]);
        let executor = Executor::new(registry, None, Duration::from_secs(120));
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let err = executor
            .run_parallel(&ctx("q"), &["sleepy".into()], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn graph_feeds_dependency_outputs_forward() {
        let registry = registry_of(vec![
            FakeAgent::new("engineer"),
            FakeAgent::new("ethicist"),
        ]);
        let executor = Executor::new(registry, None, Duration::from_secs(5));

        let graph = TaskGraph {
            nodes: vec![
                TaskNode {
                    id: 0,
                    agent: "engineer".into(),
                    input: "design a rate limiter".into(),
                    depends_on: vec![],
                    output: None,
                },
                TaskNode {
                    id: 1,
                    agent: "ethicist".into(),
                    input: "critique the design".into(),
                    depends_on: vec![0],
                    output: None,
                },
            ],
        };

        let mut run_ctx = ctx("design and critique a rate limiter");
        let replies = executor
            .run_graph(&mut run_ctx, graph, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].agent, "engineer");
        assert_eq!(replies[1].agent, "ethicist");
        // the ethicist saw the engineer's output
        assert!(replies[1].content.contains("design a rate limiter"));
        assert!(replies[1].content.contains("Outputs from earlier tasks"));

        // outputs were materialized before dependents started
        assert_eq!(run_ctx.partial_outputs.len(), 2);
        let graph = run_ctx.task_graph.unwrap();
        assert!(graph.nodes[0].output.is_some());
        assert!(graph.nodes[1].output.is_some());
    }

    #[tokio::test]
    async fn graph_with_failed_dependency_still_completes() {
        let registry = registry_of(vec![
            FakeAgent::new("engineer").failing(),
            FakeAgent::new("ethicist"),
        ]);
        let executor = Executor::new(registry, None, Duration::from_secs(5));
        let graph = TaskGraph {
            nodes: vec![
                TaskNode {
                    id: 0,
                    agent: "engineer".into(),
                    input: "a".into(),
                    depends_on: vec![],
                    output: None,
                },
                TaskNode {
                    id: 1,
                    agent: "ethicist".into(),
                    input: "b".into(),
                    depends_on: vec![0],
                    output: None,
                },
            ],
        };
        let mut run_ctx = ctx("q");
        let replies = executor
            .run_graph(&mut run_ctx, graph, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(replies[0].confidence, 0.0);
        // dependent ran and received the failure note as input
        assert!(replies[1].content.contains("engineer unavailable"));
    }
}
