use crate::{
    AttrValue, DurationValue, Edge, Graph, Node, PipelineError, Result, Subgraph,
};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph as DotSubgraph, Vertex,
};
use indexmap::IndexMap;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: IndexMap<String, AttrValue>,
    edge_defaults: IndexMap<String, AttrValue>,
    subgraph: Option<String>,
}

/// Parse a DOT digraph into the typed pipeline graph.
///
/// Supported subset: directed graphs only, no `strict`, no ports, no HTML
/// labels. Unquoted duration literals (`timeout=90s`) are quoted before
/// the DOT grammar sees them.
pub fn parse_dot(source: &str) -> Result<Graph> {
    if has_undirected_edge(source) {
        return Err(PipelineError::InvalidGraph(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let normalized = quote_duration_literals(source);
    let parsed = graphviz_rust::parse(&normalized).map_err(PipelineError::DotParse)?;
    build_graph(parsed)
}

fn build_graph(parsed: DotGraph) -> Result<Graph> {
    let (id, strict, directed, stmts) = match parsed {
        DotGraph::DiGraph { id, strict, stmts } => (id, strict, true, stmts),
        DotGraph::Graph { id, strict, stmts } => (id, strict, false, stmts),
    };

    if !directed {
        return Err(PipelineError::InvalidGraph(
            "only 'digraph' is supported".to_string(),
        ));
    }
    if strict {
        return Err(PipelineError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut graph = Graph::new(id_text(&id)?);
    walk_statements(&mut graph, &stmts, &Scope::default(), true)?;
    Ok(graph)
}

fn walk_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent: &Scope,
    top_level: bool,
) -> Result<()> {
    let mut scope = parent.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(GraphAttributes::Node(attrs)) => {
                for attr in attrs {
                    let (key, value) = read_attribute(attr)?;
                    scope.node_defaults.insert(key, value);
                }
                if top_level {
                    graph.node_defaults = scope.node_defaults.clone();
                }
            }
            Stmt::GAttribute(GraphAttributes::Edge(attrs)) => {
                for attr in attrs {
                    let (key, value) = read_attribute(attr)?;
                    scope.edge_defaults.insert(key, value);
                }
                if top_level {
                    graph.edge_defaults = scope.edge_defaults.clone();
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                if top_level {
                    for attr in attrs {
                        let (key, value) = read_attribute(attr)?;
                        apply_graph_attr(graph, &key, value);
                    }
                }
            }
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = read_attribute(attr)?;
                    apply_graph_attr(graph, &key, value);
                }
            }
            Stmt::Node(node) => walk_node(graph, node, &scope)?,
            Stmt::Edge(edge) => walk_edge(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => walk_subgraph(graph, subgraph, &scope)?,
        }
    }

    Ok(())
}

fn walk_subgraph(graph: &mut Graph, subgraph: &DotSubgraph, parent: &Scope) -> Result<()> {
    let name = match &subgraph.id {
        Id::Anonymous(_) => format!("subgraph_{}", graph.subgraphs.len()),
        other => id_text(other)?,
    };
    let label = subgraph_label(&subgraph.stmts)?;

    graph.subgraphs.insert(
        name.clone(),
        Subgraph {
            name: name.clone(),
            label,
            node_ids: Vec::new(),
        },
    );

    let mut scope = parent.clone();
    scope.subgraph = Some(name);
    walk_statements(graph, &subgraph.stmts, &scope, false)
}

fn subgraph_label(stmts: &[Stmt]) -> Result<String> {
    let mut label = String::new();
    for stmt in stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) => {
                if id_text(key)? == "label" {
                    label = id_text(value)?;
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = read_attribute(attr)?;
                    if key == "label" {
                        label = value.to_display_string();
                    }
                }
            }
            _ => {}
        }
    }
    Ok(label)
}

fn walk_node(graph: &mut Graph, node: &DotNode, scope: &Scope) -> Result<()> {
    let node_id = node_id_text(&node.id)?;
    ensure_node(graph, &node_id, scope);

    for attr in &node.attributes {
        let (key, value) = read_attribute(attr)?;
        let entry = graph
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| PipelineError::InvalidGraph(format!("node '{node_id}' vanished")))?;
        apply_node_attr(entry, &key, value);
    }
    Ok(())
}

fn walk_edge(graph: &mut Graph, edge: &DotEdge, scope: &Scope) -> Result<()> {
    let vertices: Vec<String> = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![vertex_text(from)?, vertex_text(to)?],
        EdgeTy::Chain(chain) => {
            let mut out = Vec::with_capacity(chain.len());
            for vertex in chain {
                out.push(vertex_text(vertex)?);
            }
            out
        }
    };
    if vertices.len() < 2 {
        return Err(PipelineError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    for id in &vertices {
        ensure_node(graph, id, scope);
    }

    for pair in vertices.windows(2) {
        let mut out = Edge::new(pair[0].clone(), pair[1].clone());
        for (key, value) in &scope.edge_defaults {
            apply_edge_attr(&mut out, key, value.clone());
        }
        for attr in &edge.attributes {
            let (key, value) = read_attribute(attr)?;
            apply_edge_attr(&mut out, &key, value);
        }
        graph.edges.push(out);
    }
    Ok(())
}

/// Create the node on first sight, seeding it with the scope's node
/// defaults and subgraph membership. Edge endpoints declare nodes
/// implicitly, as in DOT proper.
fn ensure_node(graph: &mut Graph, node_id: &str, scope: &Scope) {
    if !graph.nodes.contains_key(node_id) {
        let mut node = Node::new(node_id);
        for (key, value) in &scope.node_defaults {
            apply_node_attr(&mut node, key, value.clone());
        }
        graph.nodes.insert(node_id.to_string(), node);
    }

    if let Some(subgraph_name) = scope.subgraph.as_deref() {
        let node = graph
            .nodes
            .get_mut(node_id)
            .filter(|node| node.subgraph.is_none());
        if let Some(node) = node {
            node.subgraph = Some(subgraph_name.to_string());
            if let Some(subgraph) = graph.subgraphs.get_mut(subgraph_name) {
                subgraph.node_ids.push(node_id.to_string());
            }
        }
    }
}

fn apply_graph_attr(graph: &mut Graph, key: &str, value: AttrValue) {
    match key {
        "name" => graph.name = value.to_display_string(),
        "goal" => graph.goal = value.to_display_string(),
        "model_stylesheet" => graph.model_stylesheet = value.to_display_string(),
        "default_max_retry" | "default_max_retries" => {
            if let Some(count) = value.as_i64() {
                graph.default_max_retries = count.max(0) as u32;
            }
        }
        "retry_target" => graph.retry_target = non_empty(value),
        "fallback_retry_target" => graph.fallback_retry_target = non_empty(value),
        "default_fidelity" => graph.default_fidelity = non_empty(value),
        _ => {
            graph.extra.insert(key.to_string(), value);
        }
    }
}

fn apply_node_attr(node: &mut Node, key: &str, value: AttrValue) {
    match key {
        "label" => node.label = value.to_display_string(),
        "shape" => node.shape = value.to_display_string(),
        "type" => node.node_type = non_empty(value),
        "prompt" => node.prompt = non_empty(value),
        "max_retries" => {
            if let Some(count) = attr_i64(&value) {
                node.max_retries = count.max(0) as u32;
            }
        }
        "goal_gate" => node.goal_gate = attr_bool(&value).unwrap_or(node.goal_gate),
        "retry_target" => node.retry_target = non_empty(value),
        "fallback_retry_target" => node.fallback_retry_target = non_empty(value),
        "fidelity" => node.fidelity = non_empty(value),
        "thread_id" => node.thread_id = non_empty(value),
        "class" => {
            for entry in value.to_display_string().split(',') {
                let class = entry.trim();
                if !class.is_empty() && !node.classes.iter().any(|existing| existing == class) {
                    node.classes.push(class.to_string());
                }
            }
        }
        "timeout" => node.timeout = attr_duration(&value),
        "llm_model" => node.llm_model = non_empty(value),
        "llm_provider" => node.llm_provider = non_empty(value),
        "reasoning_effort" => node.reasoning_effort = non_empty(value),
        "auto_status" => node.auto_status = attr_bool(&value).unwrap_or(node.auto_status),
        "allow_partial" => node.allow_partial = attr_bool(&value).unwrap_or(node.allow_partial),
        _ => {
            node.extra.insert(key.to_string(), value);
        }
    }
}

fn apply_edge_attr(edge: &mut Edge, key: &str, value: AttrValue) {
    match key {
        "label" => edge.label = value.to_display_string(),
        "condition" => edge.condition = value.to_display_string(),
        "weight" => edge.weight = attr_i64(&value).unwrap_or(0),
        "fidelity" => edge.fidelity = non_empty(value),
        "thread_id" => edge.thread_id = non_empty(value),
        "loop_restart" => edge.loop_restart = attr_bool(&value).unwrap_or(edge.loop_restart),
        _ => {
            edge.extra.insert(key.to_string(), value);
        }
    }
}

fn non_empty(value: AttrValue) -> Option<String> {
    let text = value.to_display_string();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn attr_i64(value: &AttrValue) -> Option<i64> {
    match value {
        AttrValue::Integer(inner) => Some(*inner),
        AttrValue::String(inner) => inner.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn attr_bool(value: &AttrValue) -> Option<bool> {
    match value {
        AttrValue::Boolean(inner) => Some(*inner),
        AttrValue::String(inner) => match inner.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn attr_duration(value: &AttrValue) -> Option<Duration> {
    match value {
        AttrValue::Duration(inner) => Some(Duration::from_millis(inner.millis)),
        // A bare integer timeout is taken as seconds.
        AttrValue::Integer(inner) if *inner >= 0 => Some(Duration::from_secs(*inner as u64)),
        AttrValue::String(inner) => {
            parse_duration_literal(inner).map(|d| Duration::from_millis(d.millis))
        }
        _ => None,
    }
}

fn read_attribute(attr: &Attribute) -> Result<(String, AttrValue)> {
    let key = id_text(&attr.0)?;
    let value = attr_value(&attr.1)?;
    Ok((key, value))
}

fn attr_value(id: &Id) -> Result<AttrValue> {
    match id {
        Id::Html(_) => Err(PipelineError::InvalidGraph(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => {
            let text = id_text(id)?;
            if let Some(duration) = parse_duration_literal(&text) {
                Ok(AttrValue::Duration(duration))
            } else {
                Ok(AttrValue::String(text))
            }
        }
        Id::Plain(raw) => Ok(plain_value(raw)),
        Id::Anonymous(raw) => Ok(AttrValue::String(raw.clone())),
    }
}

fn plain_value(raw: &str) -> AttrValue {
    match raw {
        "true" => return AttrValue::Boolean(true),
        "false" => return AttrValue::Boolean(false),
        _ => {}
    }
    if let Some(duration) = parse_duration_literal(raw) {
        return AttrValue::Duration(duration);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return AttrValue::Integer(value);
    }
    if raw.contains('.') {
        if let Ok(value) = raw.parse::<f64>() {
            return AttrValue::Float(value);
        }
    }
    AttrValue::String(raw.to_string())
}

pub fn parse_duration_literal(raw: &str) -> Option<DurationValue> {
    if raw.len() < 2 {
        return None;
    }
    let unit = ["ms", "s", "m", "h", "d"]
        .into_iter()
        .find(|unit| raw.ends_with(unit))?;
    let amount = raw[..raw.len() - unit.len()].parse::<u64>().ok()?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(DurationValue {
        raw: raw.to_string(),
        millis: amount.saturating_mul(factor),
    })
}

fn vertex_text(vertex: &Vertex) -> Result<String> {
    match vertex {
        Vertex::N(node_id) => node_id_text(node_id),
        Vertex::S(_) => Err(PipelineError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn node_id_text(node_id: &NodeId) -> Result<String> {
    if node_id.1.is_some() {
        return Err(PipelineError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    id_text(&node_id.0)
}

fn id_text(id: &Id) -> Result<String> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .ok_or_else(|| {
                    PipelineError::InvalidGraph(format!(
                        "escaped string '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape(unquoted))
        }
        Id::Html(_) => Err(PipelineError::InvalidGraph(
            "HTML labels are not supported".to_string(),
        )),
    }
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Scan outside strings and comments for the undirected edge token.
fn has_undirected_edge(source: &str) -> bool {
    let bytes = source.as_bytes();
    let mut index = 0;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while index < bytes.len() {
        let current = bytes[index] as char;
        let next = bytes.get(index + 1).map(|b| *b as char);

        if in_line_comment {
            in_line_comment = current != '\n';
            index += 1;
            continue;
        }
        if in_block_comment {
            if current == '*' && next == Some('/') {
                in_block_comment = false;
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }
        if in_string {
            if current == '\\' {
                index += 2;
                continue;
            }
            if current == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }
        match (current, next) {
            ('/', Some('/')) => {
                in_line_comment = true;
                index += 2;
                continue;
            }
            ('/', Some('*')) => {
                in_block_comment = true;
                index += 2;
                continue;
            }
            ('"', _) => {
                in_string = true;
                index += 1;
                continue;
            }
            ('-', Some('-')) => return true,
            _ => {}
        }
        index += 1;
    }

    false
}

/// Quote bare duration literals after `=` so the DOT grammar accepts them.
fn quote_duration_literals(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 16);
    let mut index = 0;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while index < bytes.len() {
        let current = bytes[index] as char;
        let next = bytes.get(index + 1).map(|b| *b as char);

        if in_line_comment {
            out.push(current);
            in_line_comment = current != '\n';
            index += 1;
            continue;
        }
        if in_block_comment {
            out.push(current);
            if current == '*' && next == Some('/') {
                out.push('/');
                in_block_comment = false;
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }
        if in_string {
            out.push(current);
            if current == '\\' {
                if let Some(escaped) = next {
                    out.push(escaped);
                    index += 2;
                    continue;
                }
            }
            if current == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }

        match (current, next) {
            ('/', Some('/')) => {
                out.push_str("//");
                in_line_comment = true;
                index += 2;
                continue;
            }
            ('/', Some('*')) => {
                out.push_str("/*");
                in_block_comment = true;
                index += 2;
                continue;
            }
            ('"', _) => {
                out.push('"');
                in_string = true;
                index += 1;
                continue;
            }
            ('=', _) => {
                out.push('=');
                index += 1;
                while index < bytes.len() && (bytes[index] as char).is_whitespace() {
                    out.push(bytes[index] as char);
                    index += 1;
                }
                let token_start = index;
                while index < bytes.len() && (bytes[index] as char).is_ascii_alphanumeric() {
                    index += 1;
                }
                let token = &source[token_start..index];
                if parse_duration_literal(token).is_some() {
                    out.push('"');
                    out.push_str(token);
                    out.push('"');
                } else {
                    out.push_str(token);
                }
                continue;
            }
            _ => {}
        }

        out.push(current);
        index += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dot_linear_graph_expected_typed_nodes_and_edges() {
        let graph = parse_dot(
            r#"
            digraph review {
                graph [goal="Ship it", default_max_retry=3]
                start [shape=Mdiamond]
                plan [shape=box, prompt="Plan for $goal", max_retries=2]
                exit [shape=Msquare]
                start -> plan -> exit
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.name, "review");
        assert_eq!(graph.goal, "Ship it");
        assert_eq!(graph.default_max_retries, 3);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);

        let plan = graph.node("plan").expect("plan node should exist");
        assert_eq!(plan.prompt.as_deref(), Some("Plan for $goal"));
        assert_eq!(plan.max_retries, 2);
    }

    #[test]
    fn parse_dot_edge_attributes_expected_typed_fields() {
        let graph = parse_dot(
            r#"
            digraph G {
                a
                b
                a -> b [label="[Y] Yes", condition="outcome=success", weight=5, loop_restart=true]
            }
            "#,
        )
        .expect("graph should parse");

        let edge = &graph.edges[0];
        assert_eq!(edge.label, "[Y] Yes");
        assert_eq!(edge.condition, "outcome=success");
        assert_eq!(edge.weight, 5);
        assert!(edge.loop_restart);
    }

    #[test]
    fn parse_dot_implicit_edge_endpoints_expected_nodes_created() {
        let graph = parse_dot("digraph G { a -> b -> c }").expect("graph should parse");
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn parse_dot_subgraph_expected_membership_and_label() {
        let graph = parse_dot(
            r#"
            digraph G {
                subgraph cluster_review {
                    label="Review Loop"
                    node [timeout=900s]
                    check
                }
                other
            }
            "#,
        )
        .expect("graph should parse");

        let subgraph = graph
            .subgraphs
            .get("cluster_review")
            .expect("subgraph should exist");
        assert_eq!(subgraph.derived_class(), Some("review-loop".to_string()));
        assert_eq!(subgraph.node_ids, vec!["check".to_string()]);

        let check = graph.node("check").expect("check should exist");
        assert_eq!(check.subgraph.as_deref(), Some("cluster_review"));
        assert_eq!(check.timeout, Some(Duration::from_secs(900)));

        let other = graph.node("other").expect("other should exist");
        assert_eq!(other.subgraph, None);
        assert_eq!(other.timeout, None);
    }

    #[test]
    fn parse_dot_node_extra_attributes_expected_preserved() {
        let graph = parse_dot(
            r#"
            digraph G {
                fan [shape=component, join_policy="k_of_n", k=2, error_policy="fail_fast"]
            }
            "#,
        )
        .expect("graph should parse");

        let fan = graph.node("fan").expect("fan should exist");
        assert_eq!(fan.extra_str("join_policy"), Some("k_of_n"));
        assert_eq!(fan.extra_i64("k"), Some(2));
        assert_eq!(fan.extra_str("error_policy"), Some("fail_fast"));
    }

    #[test]
    fn parse_dot_undirected_edge_expected_error() {
        let error = parse_dot("digraph G { a -- b }").expect_err("parse must fail");
        assert!(error.to_string().contains("undirected edge token"));
    }

    #[test]
    fn parse_dot_html_label_expected_error() {
        let error = parse_dot("digraph G { a [label=<<b>>] }").expect_err("parse must fail");
        assert!(error.to_string().contains("HTML"));
    }

    #[test]
    fn parse_duration_literal_units_expected_millis() {
        assert_eq!(
            parse_duration_literal("500ms").expect("should parse").millis,
            500
        );
        assert_eq!(
            parse_duration_literal("90s").expect("should parse").millis,
            90_000
        );
        assert_eq!(
            parse_duration_literal("2h").expect("should parse").millis,
            7_200_000
        );
        assert!(parse_duration_literal("ninety").is_none());
    }

    #[test]
    fn quote_duration_literals_unquoted_expected_quoted() {
        let normalized = quote_duration_literals("digraph G { a [timeout=90s] }");
        assert!(normalized.contains("timeout=\"90s\""));
    }
}
