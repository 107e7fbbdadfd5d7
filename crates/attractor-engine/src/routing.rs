use crate::{evaluate_condition, ContextMap, Edge, Graph, Outcome};

/// Which step of the selection cascade produced the winner. The runner
/// refuses to route a Fail outcome through the `AnyEdge` fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionStep {
    Condition,
    PreferredLabel,
    SuggestedIds,
    Unconditional,
    AnyEdge,
}

#[derive(Clone, Copy, Debug)]
pub struct SelectedEdge<'a> {
    pub edge: &'a Edge,
    pub step: SelectionStep,
}

/// Five-step edge selection. Outgoing edges are considered in insertion
/// order; the first step that yields candidates supplies the winner, with
/// ties broken by weight descending then target id ascending.
pub fn select_edge<'a>(
    graph: &'a Graph,
    from: &str,
    outcome: &Outcome,
    context: &ContextMap,
) -> Option<SelectedEdge<'a>> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from).collect();
    if edges.is_empty() {
        return None;
    }

    // Step 1: edges whose non-empty condition evaluates true.
    let matched: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.condition.trim();
            !condition.is_empty() && evaluate_condition(condition, outcome, context)
        })
        .collect();
    if let Some(edge) = best_edge(&matched) {
        return Some(SelectedEdge {
            edge,
            step: SelectionStep::Condition,
        });
    }

    // Step 2: preferred-label match over all outgoing edges.
    if let Some(preferred) = outcome.preferred_label.as_deref() {
        if !preferred.trim().is_empty() {
            let wanted = normalize_label(preferred);
            let labeled: Vec<&Edge> = edges
                .iter()
                .copied()
                .filter(|edge| normalize_label(&edge.label) == wanted)
                .collect();
            if let Some(edge) = best_edge(&labeled) {
                return Some(SelectedEdge {
                    edge,
                    step: SelectionStep::PreferredLabel,
                });
            }
        }
    }

    // Step 3: suggested ids, walked in suggestion order.
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = edges.iter().copied().find(|edge| edge.to == *suggested) {
            return Some(SelectedEdge {
                edge,
                step: SelectionStep::SuggestedIds,
            });
        }
    }

    // Step 4: unconditional edges by weight.
    let unconditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| edge.condition.trim().is_empty())
        .collect();
    if let Some(edge) = best_edge(&unconditional) {
        return Some(SelectedEdge {
            edge,
            step: SelectionStep::Unconditional,
        });
    }

    // Step 5: any edge at all.
    best_edge(&edges).map(|edge| SelectedEdge {
        edge,
        step: SelectionStep::AnyEdge,
    })
}

/// Highest weight wins; equal weights resolve to the lexicographically
/// smallest target id.
fn best_edge<'a>(edges: &[&'a Edge]) -> Option<&'a Edge> {
    let mut best: Option<&Edge> = None;
    for edge in edges {
        match best {
            None => best = Some(edge),
            Some(current) => {
                if edge.weight > current.weight
                    || (edge.weight == current.weight && edge.to < current.to)
                {
                    best = Some(edge);
                }
            }
        }
    }
    best
}

/// Normalize a label for preferred-label matching: strip one accelerator
/// prefix (`[X] `, `X) `, `X - `), lowercase, collapse whitespace.
pub fn normalize_label(label: &str) -> String {
    let lowered = label.trim().to_lowercase();
    let stripped = strip_accelerator(&lowered);
    collapse_whitespace(stripped)
}

fn strip_accelerator(label: &str) -> &str {
    if let Some(rest) = label
        .strip_prefix('[')
        .and_then(|inner| inner.split_once(']'))
        .map(|(_, rest)| rest)
    {
        return rest.trim_start();
    }

    let bytes = label.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphanumeric()
        && bytes[1] == b')'
        && bytes[2] == b' '
    {
        return label[3..].trim_start();
    }
    if bytes.len() >= 4 && bytes[0].is_ascii_alphanumeric() && &label[1..4] == " - " {
        return label[4..].trim_start();
    }
    label
}

fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !previous_space && !out.is_empty() {
                out.push(' ');
            }
            previous_space = true;
        } else {
            out.push(ch);
            previous_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_dot, Outcome, StageStatus};

    fn success() -> Outcome {
        Outcome::success()
    }

    fn failing() -> Outcome {
        let mut outcome = Outcome::success();
        outcome.status = StageStatus::Fail;
        outcome
    }

    #[test]
    fn select_edge_condition_match_expected_wins_over_everything() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; pass; fallback
                n -> pass [condition="outcome=success"]
                n -> fallback [label="Fallback", weight=100]
            }
            "#,
        )
        .expect("graph should parse");
        let mut outcome = success();
        outcome.preferred_label = Some("Fallback".to_string());

        let selected = select_edge(&graph, "n", &outcome, &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "pass");
        assert_eq!(selected.step, SelectionStep::Condition);
    }

    #[test]
    fn select_edge_condition_weight_tie_expected_lexical_target() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; b; a; c
                n -> b [condition="outcome=success", weight=5]
                n -> a [condition="outcome=success", weight=5]
                n -> c [condition="outcome=success", weight=1]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_edge(&graph, "n", &success(), &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "a");
    }

    #[test]
    fn select_edge_condition_weight_expected_highest() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; low; high
                n -> low [condition="outcome=success", weight=5]
                n -> high [condition="outcome=success", weight=10]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_edge(&graph, "n", &success(), &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "high");
    }

    #[test]
    fn select_edge_preferred_label_expected_normalized_match() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; approve; revise
                n -> approve [label="[A] Approve   It"]
                n -> revise [label="[R] Revise"]
            }
            "#,
        )
        .expect("graph should parse");
        let mut outcome = success();
        outcome.preferred_label = Some("approve it".to_string());

        let selected = select_edge(&graph, "n", &outcome, &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "approve");
        assert_eq!(selected.step, SelectionStep::PreferredLabel);
    }

    #[test]
    fn select_edge_suggested_ids_expected_first_hit_in_suggestion_order() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; a; b
                n -> a
                n -> b
            }
            "#,
        )
        .expect("graph should parse");
        let mut outcome = success();
        outcome.preferred_label = Some("nomatch".to_string());
        outcome.suggested_next_ids = vec!["missing".to_string(), "b".to_string(), "a".to_string()];

        let selected = select_edge(&graph, "n", &outcome, &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "b");
        assert_eq!(selected.step, SelectionStep::SuggestedIds);
    }

    #[test]
    fn select_edge_unconditional_expected_skips_false_conditions() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; cond; plain
                n -> cond [condition="outcome=fail", weight=50]
                n -> plain
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_edge(&graph, "n", &success(), &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "plain");
        assert_eq!(selected.step, SelectionStep::Unconditional);
    }

    #[test]
    fn select_edge_any_edge_fallback_expected_flagged() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; only
                n -> only [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_edge(&graph, "n", &success(), &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "only");
        assert_eq!(selected.step, SelectionStep::AnyEdge);
    }

    #[test]
    fn select_edge_fail_outcome_expected_condition_route() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; recover; next
                n -> next [condition="outcome=success"]
                n -> recover [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");

        let selected = select_edge(&graph, "n", &failing(), &ContextMap::new())
            .expect("edge should be selected");
        assert_eq!(selected.edge.to, "recover");
    }

    #[test]
    fn select_edge_no_edges_expected_none() {
        let graph = parse_dot("digraph G { n }").expect("graph should parse");
        assert!(select_edge(&graph, "n", &success(), &ContextMap::new()).is_none());
    }

    #[test]
    fn select_edge_deterministic_expected_same_choice() {
        let graph = parse_dot(
            r#"
            digraph G {
                n; a; b; c
                n -> c
                n -> a
                n -> b
            }
            "#,
        )
        .expect("graph should parse");

        let first = select_edge(&graph, "n", &success(), &ContextMap::new())
            .expect("edge should be selected")
            .edge
            .to
            .clone();
        for _ in 0..5 {
            let again = select_edge(&graph, "n", &success(), &ContextMap::new())
                .expect("edge should be selected")
                .edge
                .to
                .clone();
            assert_eq!(again, first);
        }
        assert_eq!(first, "a");
    }

    #[test]
    fn normalize_label_accelerator_prefixes_expected_stripped() {
        assert_eq!(normalize_label("[Y] Yes"), "yes");
        assert_eq!(normalize_label("y) Yes"), "yes");
        assert_eq!(normalize_label("Y - Yes"), "yes");
        assert_eq!(normalize_label("  Keep   Going "), "keep going");
        // Only one prefix is stripped.
        assert_eq!(normalize_label("[A] b) thing"), "b) thing");
    }
}
