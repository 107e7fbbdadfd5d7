use crate::{ContextMap, Edge, Graph, StageStatus};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FidelityMode {
    Full,
    Truncate,
    #[default]
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Truncate => "truncate",
            Self::Compact => "compact",
            Self::SummaryLow => "summary:low",
            Self::SummaryMedium => "summary:medium",
            Self::SummaryHigh => "summary:high",
        }
    }
}

impl FromStr for FidelityMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "full" => Ok(Self::Full),
            "truncate" => Ok(Self::Truncate),
            "compact" => Ok(Self::Compact),
            "summary:low" => Ok(Self::SummaryLow),
            "summary:medium" => Ok(Self::SummaryMedium),
            "summary:high" => Ok(Self::SummaryHigh),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FidelityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed stage, as recorded in the traversal log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageRecord {
    pub node_id: String,
    pub status: StageStatus,
}

/// The edge actually traversed to reach `target`, when the previous node
/// has one pointing at it.
pub fn find_incoming_edge<'a>(
    graph: &'a Graph,
    target: &str,
    previous: Option<&str>,
) -> Option<&'a Edge> {
    let from = previous?;
    graph.outgoing_edges(from).find(|edge| edge.to == target)
}

/// Fidelity precedence: traversed edge, target node, graph default,
/// compile-time default. The first non-empty *recognized* value wins.
pub fn resolve_fidelity(graph: &Graph, target: &str, incoming: Option<&Edge>) -> FidelityMode {
    let candidates = [
        incoming.and_then(|edge| edge.fidelity.as_deref()),
        graph.node(target).and_then(|node| node.fidelity.as_deref()),
        graph.default_fidelity.as_deref(),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(mode) = candidate.parse::<FidelityMode>() {
            return mode;
        }
    }
    FidelityMode::default()
}

/// Thread id precedence: edge override, node override, derived subgraph
/// class, previous node id.
pub fn resolve_thread_id(
    graph: &Graph,
    target: &str,
    incoming: Option<&Edge>,
    previous: Option<&str>,
) -> Option<String> {
    if let Some(thread_id) = incoming.and_then(|edge| edge.thread_id.as_deref()) {
        return Some(thread_id.to_string());
    }
    let node = graph.node(target)?;
    if let Some(thread_id) = node.thread_id.as_deref() {
        return Some(thread_id.to_string());
    }
    if let Some(class) = graph.subgraph_class(node) {
        return Some(class);
    }
    previous.map(ToOwned::to_owned)
}

/// The fidelity-resolved view of prior execution handed to a handler.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preamble {
    pub mode: FidelityMode,
    pub pipeline_name: String,
    pub goal: String,
    pub thread_id: Option<String>,
    pub completed_count: usize,
    pub stages: Vec<StageRecord>,
    pub context_entries: Vec<(String, Value)>,
}

impl Preamble {
    /// Rendered text form for prompt assembly.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Pipeline: {}\n", self.pipeline_name));
        if !self.goal.is_empty() {
            out.push_str(&format!("Goal: {}\n", self.goal));
        }
        if self.mode == FidelityMode::SummaryLow {
            out.push_str(&format!("Completed stages: {}\n", self.completed_count));
        }
        if !self.stages.is_empty() {
            out.push_str("Stages:\n");
            for stage in &self.stages {
                out.push_str(&format!("  {}: {}\n", stage.node_id, stage.status.as_str()));
            }
        }
        if !self.context_entries.is_empty() {
            out.push_str("Context:\n");
            for (key, value) in &self.context_entries {
                out.push_str(&format!("  {key}: {value}\n"));
            }
        }
        out
    }
}

/// Assemble the preamble for a step. `completed` is the traversal log in
/// order; `context` is the current context snapshot.
pub fn build_preamble(
    mode: FidelityMode,
    pipeline_name: &str,
    goal: &str,
    thread_id: Option<String>,
    completed: &[StageRecord],
    context: &ContextMap,
) -> Preamble {
    let mut preamble = Preamble {
        mode,
        pipeline_name: pipeline_name.to_string(),
        goal: goal.to_string(),
        thread_id: None,
        completed_count: completed.len(),
        stages: Vec::new(),
        context_entries: Vec::new(),
    };

    match mode {
        FidelityMode::Full => {
            preamble.thread_id = thread_id;
            preamble.stages = completed.to_vec();
            preamble.context_entries = context
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
        }
        FidelityMode::Truncate => {}
        FidelityMode::Compact => {
            preamble.stages = completed.to_vec();
            preamble.context_entries = first_entries(context, 20);
        }
        FidelityMode::SummaryLow => {}
        FidelityMode::SummaryMedium => {
            preamble.stages = last_stages(completed, 5);
        }
        FidelityMode::SummaryHigh => {
            preamble.stages = last_stages(completed, 10);
            preamble.context_entries = first_entries(context, 30);
        }
    }

    preamble
}

fn first_entries(context: &ContextMap, limit: usize) -> Vec<(String, Value)> {
    context
        .iter()
        .take(limit)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn last_stages(completed: &[StageRecord], limit: usize) -> Vec<StageRecord> {
    let skip = completed.len().saturating_sub(limit);
    completed[skip..].to_vec()
}
