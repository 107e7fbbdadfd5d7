use crate::{apply_stylesheet, parse_dot, validate, Diagnostic, Graph, Result};

/// A graph rewrite applied after parsing and before validation.
pub trait Transform: Send + Sync {
    fn apply(&self, graph: &mut Graph) -> Result<()>;
}

/// Substitutes `$goal` in every node prompt with the graph's goal.
/// Idempotent: expanded prompts contain no `$goal` token to re-expand.
#[derive(Clone, Copy, Debug, Default)]
pub struct VariableExpansion;

impl Transform for VariableExpansion {
    fn apply(&self, graph: &mut Graph) -> Result<()> {
        if graph.goal.is_empty() {
            return Ok(());
        }
        let goal = graph.goal.clone();
        for node in graph.nodes.values_mut() {
            if let Some(prompt) = node.prompt.as_ref() {
                if prompt.contains("$goal") {
                    node.prompt = Some(prompt.replace("$goal", &goal));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StylesheetApplication;

impl Transform for StylesheetApplication {
    fn apply(&self, graph: &mut Graph) -> Result<()> {
        apply_stylesheet(graph)
    }
}

pub fn apply_builtin_transforms(graph: &mut Graph) -> Result<()> {
    VariableExpansion.apply(graph)?;
    StylesheetApplication.apply(graph)?;
    Ok(())
}

/// Parse, transform, and validate a DOT pipeline in one step. Returns the
/// prepared graph together with all diagnostics; callers decide whether
/// warnings matter (the runner refuses error-severity findings anyway).
pub fn prepare_pipeline(
    dot_source: &str,
    custom_transforms: &[&dyn Transform],
) -> Result<(Graph, Vec<Diagnostic>)> {
    let mut graph = parse_dot(dot_source)?;
    apply_builtin_transforms(&mut graph)?;
    for transform in custom_transforms {
        transform.apply(&mut graph)?;
    }
    let diagnostics = validate(&graph, &[]);
    Ok((graph, diagnostics))
}
