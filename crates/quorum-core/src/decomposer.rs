use std::collections::HashMap;
use std::sync::Arc;

use quorum_provider::ChatMessage;
use quorum_schema::{TaskGraph, TaskNode};
use serde::Deserialize;

use crate::agent::AgentRegistry;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{ChatParams, ModelGateway};
use crate::prompts::{PromptStore, DECOMPOSER_PLAN};

pub const DEFAULT_MAX_NODES: usize = 8;

/// Splits a collaborative query into an ordered task graph. Any failure
/// (unparseable plan, unknown agent, cycle, runaway fanout) returns None
/// and the caller falls back to single-agent routing.
pub struct Decomposer {
    gateway: Arc<ModelGateway>,
    prompts: Arc<PromptStore>,
    params: ChatParams,
    max_nodes: usize,
}

#[derive(Deserialize)]
struct RawNode {
    id: i64,
    agent: String,
    input: String,
    #[serde(default)]
    depends_on: Vec<i64>,
}

impl Decomposer {
    pub fn new(gateway: Arc<ModelGateway>, prompts: Arc<PromptStore>, params: ChatParams) -> Self {
        Self {
            gateway,
            prompts,
            params,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }

    pub async fn decompose(&self, query: &str, registry: &AgentRegistry) -> Option<TaskGraph> {
        let prompt = self
            .prompts
            .render(
                DECOMPOSER_PLAN,
                &[
                    ("agents", &registry.capability_lines()),
                    ("query", query),
                    ("max_tasks", &self.max_nodes.to_string()),
                ],
            )
            .ok()?;

        let response = match self
            .gateway
            .complete(vec![ChatMessage::user(prompt)], &self.params)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("decomposer call failed: {e}");
                return None;
            }
        };

        match parse_plan(&response.text, registry, self.max_nodes) {
            Some(graph) => Some(graph),
            None => {
                tracing::warn!("decomposer produced an invalid plan, falling back");
                None
            }
        }
    }
}

/// Parse and validate a plan: arena ids, known agents, in-range
/// dependencies, no cycles, bounded node count.
pub fn parse_plan(text: &str, registry: &AgentRegistry, max_nodes: usize) -> Option<TaskGraph> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let raw: Vec<RawNode> = serde_json::from_str(&text[start..=end]).ok()?;

    if raw.is_empty() || raw.len() > max_nodes {
        return None;
    }

    // Remap model-chosen ids onto arena indices in declaration order.
    let index_of: HashMap<i64, usize> = raw
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id, idx))
        .collect();
    if index_of.len() != raw.len() {
        return None; // duplicate ids
    }

    let mut nodes = Vec::with_capacity(raw.len());
    for (idx, node) in raw.into_iter().enumerate() {
        if registry.get(&node.agent).is_none() {
            return None;
        }
        let mut depends_on = Vec::with_capacity(node.depends_on.len());
        for dep in node.depends_on {
            let dep_idx = *index_of.get(&dep)?;
            if dep_idx == idx {
                return None; // self-dependency
            }
            depends_on.push(dep_idx);
        }
        nodes.push(TaskNode {
            id: idx,
            agent: node.agent,
            input: node.input,
            depends_on,
            output: None,
        });
    }

    let graph = TaskGraph { nodes };
    topo_layers(&graph).ok()?;
    Some(graph)
}

/// Kahn layering: each layer's tasks depend only on earlier layers. Fails
/// on cycles.
pub fn topo_layers(graph: &TaskGraph) -> EngineResult<Vec<Vec<usize>>> {
    let n = graph.nodes.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (idx, node) in graph.nodes.iter().enumerate() {
        for &dep in &node.depends_on {
            if dep >= n {
                return Err(EngineError::ConsistencyViolation(format!(
                    "task {idx} depends on unknown task {dep}"
                )));
            }
            indegree[idx] += 1;
            dependents[dep].push(idx);
        }
    }

    let mut current: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut layers = Vec::new();
    let mut seen = 0;

    while !current.is_empty() {
        current.sort_unstable();
        seen += current.len();
        let mut next = Vec::new();
        for &idx in &current {
            for &dependent in &dependents[idx] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        layers.push(std::mem::take(&mut current));
        current = next;
    }

    if seen != n {
        return Err(EngineError::ConsistencyViolation(
            "task graph contains a cycle".into(),
        ));
    }
    Ok(layers)
}
