use crate::{FidelityMode, Graph, Node, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

impl Diagnostic {
    pub fn new(rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge = Some((from.into(), to.into()));
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// An external validation rule; errors block execution, warnings advise.
pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, graph: &Graph) -> Vec<Diagnostic>;
}

/// Optional extra rule: flags malformed edge conditions (empty keys or
/// comparison values). The evaluator itself is total, so these are
/// authoring smells rather than runtime hazards.
#[derive(Debug, Default)]
pub struct ConditionSyntaxRule;

impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }

    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for edge in &graph.edges {
            if edge.condition.trim().is_empty() {
                continue;
            }
            if let Err(message) = crate::validate_condition(&edge.condition) {
                diagnostics.push(
                    Diagnostic::new(self.name(), Severity::Warning, message)
                        .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
        diagnostics
    }
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_terminal_node(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_edge_target_exists(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_fidelity_valid(graph));
    diagnostics.extend(rule_retry_target_exists(graph));
    diagnostics.extend(rule_goal_gate_has_retry(graph));
    diagnostics.extend(rule_prompt_on_llm_nodes(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.check(graph));
    }

    diagnostics
}

/// Validate and fail on any error-severity finding. Authoring errors
/// surface here, before any node runs.
pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        return Vec::new();
    }
    vec![Diagnostic::new(
        "start_node",
        Severity::Error,
        format!(
            "pipeline must have exactly one start node; found {}",
            starts.len()
        ),
    )]
}

fn rule_terminal_node(graph: &Graph) -> Vec<Diagnostic> {
    if graph.exit_nodes().is_empty() {
        return vec![Diagnostic::new(
            "terminal_node",
            Severity::Error,
            "pipeline must have at least one exit node",
        )];
    }
    Vec::new()
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_candidates().into_iter().next() else {
        return Vec::new();
    };

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.outgoing_edges(&node_id) {
            if graph.nodes.contains_key(&edge.to) && visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }

    graph
        .nodes
        .values()
        .filter(|node| !visited.contains(&node.id))
        .map(|node| {
            Diagnostic::new(
                "reachability",
                Severity::Error,
                "node is unreachable from the start node",
            )
            .with_node(node.id.clone())
        })
        .collect()
}

fn rule_edge_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(
                    Diagnostic::new(
                        "edge_target_exists",
                        Severity::Error,
                        format!("edge endpoint '{endpoint}' does not exist"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .start_candidates()
        .into_iter()
        .filter(|start| graph.incoming_edges(&start.id).next().is_some())
        .map(|start| {
            Diagnostic::new(
                "start_no_incoming",
                Severity::Error,
                "start node must have no incoming edges",
            )
            .with_node(start.id.clone())
        })
        .collect()
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .exit_nodes()
        .into_iter()
        .filter(|exit| graph.outgoing_edges(&exit.id).next().is_some())
        .map(|exit| {
            Diagnostic::new(
                "exit_no_outgoing",
                Severity::Error,
                "exit node must have no outgoing edges",
            )
            .with_node(exit.id.clone())
        })
        .collect()
}

fn rule_fidelity_valid(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let check = |value: &str| value.parse::<FidelityMode>().is_err();

    if let Some(value) = graph.default_fidelity.as_deref() {
        if check(value) {
            diagnostics.push(Diagnostic::new(
                "fidelity_valid",
                Severity::Warning,
                format!("graph default_fidelity '{value}' is not a recognized mode"),
            ));
        }
    }
    for node in graph.nodes.values() {
        if let Some(value) = node.fidelity.as_deref() {
            if check(value) {
                diagnostics.push(
                    Diagnostic::new(
                        "fidelity_valid",
                        Severity::Warning,
                        format!("node fidelity '{value}' is not a recognized mode"),
                    )
                    .with_node(node.id.clone()),
                );
            }
        }
    }
    for edge in &graph.edges {
        if let Some(value) = edge.fidelity.as_deref() {
            if check(value) {
                diagnostics.push(
                    Diagnostic::new(
                        "fidelity_valid",
                        Severity::Warning,
                        format!("edge fidelity '{value}' is not a recognized mode"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_retry_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for (key, target) in [
        ("retry_target", graph.retry_target.as_deref()),
        ("fallback_retry_target", graph.fallback_retry_target.as_deref()),
    ] {
        if let Some(target) = target {
            if !graph.nodes.contains_key(target) {
                diagnostics.push(Diagnostic::new(
                    "retry_target_exists",
                    Severity::Warning,
                    format!("graph {key} references missing node '{target}'"),
                ));
            }
        }
    }

    for node in graph.nodes.values() {
        for (key, target) in [
            ("retry_target", node.retry_target.as_deref()),
            ("fallback_retry_target", node.fallback_retry_target.as_deref()),
        ] {
            if let Some(target) = target {
                if !graph.nodes.contains_key(target) {
                    diagnostics.push(
                        Diagnostic::new(
                            "retry_target_exists",
                            Severity::Warning,
                            format!("node {key} references missing node '{target}'"),
                        )
                        .with_node(node.id.clone()),
                    );
                }
            }
        }
    }

    diagnostics
}

fn rule_goal_gate_has_retry(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .goal_gated_nodes()
        .filter(|node| {
            node.retry_target.is_none()
                && node.fallback_retry_target.is_none()
                && graph.retry_target.is_none()
                && graph.fallback_retry_target.is_none()
        })
        .map(|node| {
            Diagnostic::new(
                "goal_gate_has_retry",
                Severity::Warning,
                "goal_gate node has no retry_target or fallback_retry_target",
            )
            .with_node(node.id.clone())
        })
        .collect()
}

fn rule_prompt_on_llm_nodes(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes
        .values()
        .filter(|node| is_llm_node(node))
        .filter(|node| node.prompt.is_none() && node.label.is_empty())
        .map(|node| {
            Diagnostic::new(
                "prompt_on_llm_nodes",
                Severity::Warning,
                "codergen node has neither prompt nor label",
            )
            .with_node(node.id.clone())
        })
        .collect()
}

fn is_llm_node(node: &Node) -> bool {
    if let Some(node_type) = node.node_type.as_deref() {
        return node_type == "codergen";
    }
    matches!(node.shape.as_str(), "box") || !known_shape(&node.shape)
}

fn known_shape(shape: &str) -> bool {
    matches!(
        shape,
        "Mdiamond"
            | "Msquare"
            | "box"
            | "hexagon"
            | "diamond"
            | "component"
            | "tripleoctagon"
            | "parallelogram"
            | "house"
    )
}
