use crate::{Graph, Node, PipelineError, Result};

const RECOGNIZED_PROPERTIES: [&str; 3] = ["llm_model", "llm_provider", "reasoning_effort"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Universal,
    Class(String),
    NodeId(String),
}

impl Selector {
    fn specificity(&self) -> usize {
        match self {
            Self::Universal => 0,
            Self::Class(_) => 1,
            Self::NodeId(_) => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyleRule {
    pub selector: Selector,
    pub declarations: Vec<(String, String)>,
    pub order: usize,
}

impl StyleRule {
    fn matches(&self, node: &Node, subgraph_class: Option<&str>) -> bool {
        match &self.selector {
            Selector::Universal => true,
            Selector::NodeId(id) => *id == node.id,
            Selector::Class(name) => {
                node.classes.iter().any(|class| class == name) || subgraph_class == Some(name)
            }
        }
    }
}

/// Parse `SELECTOR { prop: value; ... }` rules. Unknown properties are
/// dropped silently; a rule may end up with no declarations.
pub fn parse_stylesheet(source: &str) -> Result<Vec<StyleRule>> {
    let mut rules = Vec::new();
    let mut rest = source;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let open = rest.find('{').ok_or_else(|| {
            PipelineError::StylesheetParse("missing '{' after selector".to_string())
        })?;
        let selector = parse_selector(rest[..open].trim())?;

        let body = &rest[open + 1..];
        let close = body.find('}').ok_or_else(|| {
            PipelineError::StylesheetParse("missing '}' closing rule block".to_string())
        })?;

        let declarations = parse_declarations(&body[..close])?;
        rules.push(StyleRule {
            selector,
            declarations,
            order: rules.len(),
        });

        rest = &body[close + 1..];
    }

    Ok(rules)
}

fn parse_selector(raw: &str) -> Result<Selector> {
    if raw.is_empty() {
        return Err(PipelineError::StylesheetParse(
            "empty selector".to_string(),
        ));
    }
    if raw == "*" {
        return Ok(Selector::Universal);
    }
    if let Some(id) = raw.strip_prefix('#') {
        if id.is_empty() {
            return Err(PipelineError::StylesheetParse(
                "'#' selector is missing a node id".to_string(),
            ));
        }
        return Ok(Selector::NodeId(id.to_string()));
    }
    if let Some(class) = raw.strip_prefix('.') {
        if class.is_empty() {
            return Err(PipelineError::StylesheetParse(
                "'.' selector is missing a class name".to_string(),
            ));
        }
        return Ok(Selector::Class(class.to_string()));
    }
    Err(PipelineError::StylesheetParse(format!(
        "unsupported selector '{raw}'"
    )))
}

fn parse_declarations(block: &str) -> Result<Vec<(String, String)>> {
    let mut declarations = Vec::new();

    for raw in block.split(';') {
        let declaration = raw.trim();
        if declaration.is_empty() {
            continue;
        }
        let (property, value) = declaration.split_once(':').ok_or_else(|| {
            PipelineError::StylesheetParse(format!("declaration '{declaration}' is missing ':'"))
        })?;
        let property = property.trim();
        let value = unquote(value.trim());
        if value.is_empty() {
            return Err(PipelineError::StylesheetParse(format!(
                "property '{property}' has an empty value"
            )));
        }
        if !RECOGNIZED_PROPERTIES.contains(&property) {
            continue;
        }
        declarations.push((property.to_string(), value));
    }

    Ok(declarations)
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Apply the graph's `model_stylesheet` to every node. Matching rules are
/// ranked by (specificity, declaration order); the highest-ranked value
/// wins. Properties set in DOT at parse time are never overwritten, which
/// also preserves the `reasoning_effort` sentinel semantics: an explicit
/// `reasoning_effort="high"` survives, an unset one may be styled.
pub fn apply_stylesheet(graph: &mut Graph) -> Result<()> {
    if graph.model_stylesheet.trim().is_empty() {
        return Ok(());
    }
    let rules = parse_stylesheet(&graph.model_stylesheet)?;

    let subgraph_classes: Vec<Option<String>> = graph
        .nodes
        .values()
        .map(|node| graph.subgraph_class(node))
        .collect();

    for (node, subgraph_class) in graph.nodes.values_mut().zip(subgraph_classes) {
        for property in RECOGNIZED_PROPERTIES {
            if property_is_set(node, property) {
                continue;
            }
            if let Some(value) = winning_value(&rules, node, subgraph_class.as_deref(), property) {
                assign_property(node, property, value);
            }
        }
    }

    Ok(())
}

fn winning_value(
    rules: &[StyleRule],
    node: &Node,
    subgraph_class: Option<&str>,
    property: &str,
) -> Option<String> {
    let mut best: Option<(usize, usize, String)> = None;
    for rule in rules {
        if !rule.matches(node, subgraph_class) {
            continue;
        }
        let Some((_, value)) = rule.declarations.iter().find(|(name, _)| name == property) else {
            continue;
        };
        let candidate = (rule.selector.specificity(), rule.order, value.clone());
        if best
            .as_ref()
            .is_none_or(|(spec, order, _)| (candidate.0, candidate.1) > (*spec, *order))
        {
            best = Some(candidate);
        }
    }
    best.map(|(_, _, value)| value)
}

fn property_is_set(node: &Node, property: &str) -> bool {
    match property {
        "llm_model" => node.llm_model.is_some(),
        "llm_provider" => node.llm_provider.is_some(),
        "reasoning_effort" => node.reasoning_effort.is_some(),
        _ => true,
    }
}

fn assign_property(node: &mut Node, property: &str, value: String) {
    match property {
        "llm_model" => node.llm_model = Some(value),
        "llm_provider" => node.llm_provider = Some(value),
        "reasoning_effort" => node.reasoning_effort = Some(value),
        _ => {}
    }
}
