use indexmap::IndexMap;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 50;
pub const DEFAULT_REASONING_EFFORT: &str = "high";

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationValue),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DurationValue {
    pub raw: String,
    pub millis: u64,
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

/// A pipeline stage. Parsed attributes the engine understands are promoted
/// to typed fields; everything else stays in `extra`.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: u32,
    pub goal_gate: bool,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub classes: Vec<String>,
    pub timeout: Option<Duration>,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    pub reasoning_effort: Option<String>,
    pub auto_status: bool,
    pub allow_partial: bool,
    pub subgraph: Option<String>,
    pub extra: IndexMap<String, AttrValue>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            shape: "box".to_string(),
            node_type: None,
            prompt: None,
            max_retries: 0,
            goal_gate: false,
            retry_target: None,
            fallback_retry_target: None,
            fidelity: None,
            thread_id: None,
            classes: Vec::new(),
            timeout: None,
            llm_model: None,
            llm_provider: None,
            reasoning_effort: None,
            auto_status: true,
            allow_partial: false,
            subgraph: None,
            extra: IndexMap::new(),
        }
    }

    /// Label for display, falling back to the node id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    /// `reasoning_effort` with the unset sentinel resolved.
    pub fn resolved_reasoning_effort(&self) -> &str {
        self.reasoning_effort
            .as_deref()
            .unwrap_or(DEFAULT_REASONING_EFFORT)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(AttrValue::as_str)
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|value| match value {
            AttrValue::Integer(inner) => Some(*inner),
            AttrValue::String(inner) => inner.parse::<i64>().ok(),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub condition: String,
    pub weight: i64,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub loop_restart: bool,
    pub extra: IndexMap<String, AttrValue>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: String::new(),
            condition: String::new(),
            weight: 0,
            fidelity: None,
            thread_id: None,
            loop_restart: false,
            extra: IndexMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subgraph {
    pub name: String,
    pub label: String,
    pub node_ids: Vec<String>,
}

impl Subgraph {
    /// Class name derived from the label: lowercased, spaces collapsed to
    /// hyphens, everything else non-alphanumeric stripped.
    pub fn derived_class(&self) -> Option<String> {
        derive_class_name(&self.label)
    }
}

pub fn derive_class_name(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_dash = false;
        } else if (ch.is_ascii_whitespace() || ch == '-') && !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { None } else { Some(out) }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    pub name: String,
    pub goal: String,
    pub nodes: IndexMap<String, Node>,
    pub edges: Vec<Edge>,
    pub subgraphs: IndexMap<String, Subgraph>,
    pub node_defaults: IndexMap<String, AttrValue>,
    pub edge_defaults: IndexMap<String, AttrValue>,
    pub model_stylesheet: String,
    pub default_max_retries: u32,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub default_fidelity: Option<String>,
    pub extra: IndexMap<String, AttrValue>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal: String::new(),
            nodes: IndexMap::new(),
            edges: Vec::new(),
            subgraphs: IndexMap::new(),
            node_defaults: IndexMap::new(),
            edge_defaults: IndexMap::new(),
            model_stylesheet: String::new(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_target: None,
            fallback_retry_target: None,
            default_fidelity: None,
            extra: IndexMap::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn is_start_node(node: &Node) -> bool {
        node.node_type.as_deref() == Some("start") || node.shape == "Mdiamond"
    }

    pub fn is_exit_node(node: &Node) -> bool {
        node.node_type.as_deref() == Some("exit") || node.shape == "Msquare"
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| Self::is_start_node(node))
            .collect()
    }

    pub fn exit_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| Self::is_exit_node(node))
            .collect()
    }

    /// Goal-gated nodes in declaration order.
    pub fn goal_gated_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|node| node.goal_gate)
    }

    /// Class derived from the subgraph enclosing `node`, if any.
    pub fn subgraph_class(&self, node: &Node) -> Option<String> {
        let name = node.subgraph.as_deref()?;
        self.subgraphs.get(name)?.derived_class()
    }
}
