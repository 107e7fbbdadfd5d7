use crate::handlers::NodeHandler;
use crate::{
    evaluate_condition, ContextStore, Graph, Node, Outcome, Preamble, Result,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Supervises a child pipeline through the shared outcome contract: each
/// cycle observes the child's status keys in context and stops when the
/// child finishes, a stop condition holds, or the cycle budget runs out.
/// The child runner itself lives outside the engine.
#[derive(Debug, Default)]
pub struct ManagerLoopHandler;

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let max_cycles = node.extra_i64("manager.max_cycles").unwrap_or(1).max(1) as u64;
        let stop_condition = node
            .extra_str("manager.stop_condition")
            .unwrap_or_default()
            .trim()
            .to_string();

        for cycle in 1..=max_cycles {
            if cancel.is_cancelled() {
                return Ok(Outcome::fail("manager loop cancelled"));
            }

            let status = context
                .get("stack.child.status")?
                .and_then(|value| value.as_str().map(ToOwned::to_owned));
            match status.as_deref() {
                Some("completed") => {
                    return Ok(finished(cycle, "child pipeline completed"));
                }
                Some("failed") => {
                    return Ok(Outcome::fail("child pipeline failed"));
                }
                _ => {}
            }

            if !stop_condition.is_empty() {
                let snapshot = context.values()?;
                if evaluate_condition(&stop_condition, &Outcome::success(), &snapshot) {
                    return Ok(finished(cycle, "stop condition satisfied"));
                }
            }

            tokio::task::yield_now().await;
        }

        Ok(finished(max_cycles, "cycle budget exhausted"))
    }
}

fn finished(cycles: u64, notes: &str) -> Outcome {
    let mut outcome = Outcome::success_with_notes(notes);
    outcome.context_updates.insert(
        "stack.manager.cycles".to_string(),
        Value::Number(cycles.into()),
    );
    outcome
}
