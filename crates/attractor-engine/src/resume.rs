use crate::{
    select_edge, Checkpoint, ContextMap, Graph, Outcome, PipelineError, Result, StageRecord,
    StageStatus,
};
use indexmap::IndexMap;
use serde_json::Value;

/// Runtime state reconstructed from a checkpoint. The continuation node is
/// the successor of the checkpoint's `current_node`, resolved through the
/// same edge selector the live loop uses.
#[derive(Clone, Debug)]
pub struct ResumeState {
    pub context: ContextMap,
    pub logs: Vec<String>,
    pub completed: Vec<StageRecord>,
    pub node_retries: IndexMap<String, u32>,
    pub node_outcomes: IndexMap<String, Outcome>,
    pub next_node_id: String,
}

pub fn build_resume_state(graph: &Graph, checkpoint: &Checkpoint) -> Result<ResumeState> {
    if checkpoint.current_node.is_empty() {
        return Err(PipelineError::Runtime(
            "checkpoint has no current node".to_string(),
        ));
    }
    if graph.node(&checkpoint.current_node).is_none() {
        return Err(PipelineError::Runtime(format!(
            "checkpoint current node '{}' does not exist in the graph",
            checkpoint.current_node
        )));
    }

    let completed: Vec<StageRecord> = checkpoint
        .completed_nodes
        .iter()
        .map(|node_id| StageRecord {
            node_id: node_id.clone(),
            status: checkpoint
                .node_statuses
                .get(node_id)
                .and_then(|status| StageStatus::parse(status))
                .unwrap_or(StageStatus::Success),
        })
        .collect();

    let node_outcomes: IndexMap<String, Outcome> = completed
        .iter()
        .map(|record| {
            let mut outcome = Outcome::success();
            outcome.status = record.status;
            (record.node_id.clone(), outcome)
        })
        .collect();

    let last_outcome = outcome_from_context(checkpoint);
    let next_node_id = select_edge(
        graph,
        &checkpoint.current_node,
        &last_outcome,
        &checkpoint.context,
    )
    .map(|selected| selected.edge.to.clone())
    .ok_or_else(|| {
        PipelineError::Runtime(format!(
            "checkpoint current node '{}' has no continuation edge",
            checkpoint.current_node
        ))
    })?;

    Ok(ResumeState {
        context: checkpoint.context.clone(),
        logs: checkpoint.logs.clone(),
        completed,
        node_retries: checkpoint.node_retries.clone(),
        node_outcomes,
        next_node_id,
    })
}

/// The checkpoint format carries no outcome record; rebuild the one the
/// edge selector needs from the `outcome` and `preferred_label` keys the
/// engine writes into context after every node.
fn outcome_from_context(checkpoint: &Checkpoint) -> Outcome {
    let mut outcome = Outcome::success();
    if let Some(status) = checkpoint
        .context
        .get("outcome")
        .and_then(Value::as_str)
        .and_then(StageStatus::parse)
    {
        outcome.status = status;
    }
    outcome.preferred_label = checkpoint
        .context
        .get("preferred_label")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .map(ToOwned::to_owned);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;
    use serde_json::json;

    fn checkpoint_at(current: &str, outcome: &str) -> Checkpoint {
        let mut context = ContextMap::new();
        context.insert("outcome".to_string(), json!(outcome));
        Checkpoint {
            timestamp: 1.0,
            current_node: current.to_string(),
            completed_nodes: vec!["start".to_string(), current.to_string()],
            node_retries: IndexMap::from([(current.to_string(), 2)]),
            context,
            logs: vec!["restored".to_string()],
            node_statuses: IndexMap::from([
                ("start".to_string(), "success".to_string()),
                (current.to_string(), outcome.to_string()),
            ]),
        }
    }

    #[test]
    fn build_resume_state_expected_successor_via_edge_selector() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                gate
                pass; recover
                exit [shape=Msquare]
                start -> gate
                gate -> pass [condition="outcome=success"]
                gate -> recover [condition="outcome=fail"]
                pass -> exit
                recover -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let resumed = build_resume_state(&graph, &checkpoint_at("gate", "success"))
            .expect("resume should build");
        assert_eq!(resumed.next_node_id, "pass");
        assert_eq!(resumed.completed.len(), 2);
        assert_eq!(resumed.node_retries.get("gate"), Some(&2));

        let failed = build_resume_state(&graph, &checkpoint_at("gate", "fail"))
            .expect("resume should build");
        assert_eq!(failed.next_node_id, "recover");
    }

    #[test]
    fn build_resume_state_preferred_label_expected_label_route() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                gate
                yes; no
                exit [shape=Msquare]
                start -> gate
                gate -> yes [label="Yes"]
                gate -> no [label="No"]
                yes -> exit
                no -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let mut checkpoint = checkpoint_at("gate", "success");
        checkpoint
            .context
            .insert("preferred_label".to_string(), json!("No"));

        let resumed = build_resume_state(&graph, &checkpoint).expect("resume should build");
        assert_eq!(resumed.next_node_id, "no");
    }

    #[test]
    fn build_resume_state_restores_gate_statuses_expected() {
        let graph = parse_dot(
            r#"
            digraph G {
                start [shape=Mdiamond]
                gate [goal_gate=true]
                exit [shape=Msquare]
                start -> gate -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let resumed = build_resume_state(&graph, &checkpoint_at("gate", "fail"))
            .expect("resume should build");
        assert_eq!(
            resumed
                .node_outcomes
                .get("gate")
                .map(|outcome| outcome.status),
            Some(StageStatus::Fail)
        );
    }

    #[test]
    fn build_resume_state_unknown_node_expected_error() {
        let graph = parse_dot("digraph G { a }").expect("graph should parse");
        let error = build_resume_state(&graph, &checkpoint_at("ghost", "success"))
            .expect_err("resume must fail");
        assert!(error.to_string().contains("ghost"));
    }
}
