use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result, StageStatus};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    status: StageStatus,
    score: f64,
}

/// Ranks the fan-out's branch records and publishes the winner. Ordering:
/// success class first, then score descending, then id ascending.
#[derive(Debug, Default)]
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let results = context
            .get("parallel.results")?
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default();

        let mut candidates: Vec<Candidate> = results.iter().filter_map(candidate_from).collect();
        if candidates.is_empty() {
            return Ok(Outcome::fail("no parallel results to rank"));
        }

        candidates.sort_by(|left, right| {
            success_class(left.status)
                .cmp(&success_class(right.status))
                .then_with(|| {
                    right
                        .score
                        .partial_cmp(&left.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left.id.cmp(&right.id))
        });
        let best = candidates[0].clone();

        let status = match best.status {
            StageStatus::PartialSuccess => StageStatus::PartialSuccess,
            StageStatus::Success => StageStatus::Success,
            _ => StageStatus::Fail,
        };

        let mut outcome = Outcome {
            status,
            notes: Some(format!(
                "selected branch '{}' ({})",
                best.id,
                best.status.as_str()
            )),
            ..Outcome::success()
        };
        if status == StageStatus::Fail {
            outcome.failure_reason = Some("no branch produced a usable result".to_string());
        }
        outcome.context_updates.insert(
            "parallel.fan_in.best_id".to_string(),
            Value::String(best.id),
        );
        outcome.context_updates.insert(
            "parallel.fan_in.best_outcome".to_string(),
            Value::String(best.status.as_str().to_string()),
        );
        Ok(outcome)
    }
}

fn candidate_from(value: &Value) -> Option<Candidate> {
    let record = value.as_object()?;
    let id = record
        .get("branch_id")
        .and_then(Value::as_str)
        .or_else(|| record.get("target").and_then(Value::as_str))?
        .to_string();
    let status = record
        .get("status")
        .and_then(Value::as_str)
        .and_then(StageStatus::parse)
        .unwrap_or(StageStatus::Fail);
    let score = record.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    Some(Candidate { id, status, score })
}

fn success_class(status: StageStatus) -> u8 {
    match status {
        StageStatus::Success => 0,
        StageStatus::PartialSuccess => 1,
        StageStatus::Retry => 2,
        StageStatus::Fail => 3,
        StageStatus::Skipped => 4,
    }
}
