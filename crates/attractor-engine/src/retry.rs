use crate::handlers::SharedNodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, StageStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// The node's own budget when set above zero, else the graph default.
pub fn effective_max_retries(node: &Node, graph: &Graph) -> u32 {
    if node.max_retries > 0 {
        node.max_retries
    } else {
        graph.default_max_retries
    }
}

/// FNV-1a over run and node ids. Jitter stays deterministic per
/// (run, node) so traversals are reproducible.
pub fn jitter_seed(run_id: &str, node_id: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in run_id.bytes().chain(node_id.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn delay_for_attempt(attempt: u32, config: &BackoffConfig, seed: u64) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exponent);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, seed);
    }
    Duration::from_millis(delay.round().max(0.0) as u64)
}

// xorshift* folded into [0.5, 1.5).
fn jitter_factor(attempt: u32, seed: u64) -> f64 {
    let mut x = seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let unit = (x.wrapping_mul(0x2545F4914F6CDD1D) as f64) / (u64::MAX as f64);
    0.5 + unit
}

/// Drive one handler invocation through the retry machinery.
///
/// A handler error or a Retry status consumes retry budget; a returned
/// Fail does not (it routes immediately). The node timeout wraps each
/// attempt; expiry cancels the attempt's child token and fails the node
/// with `failure_reason = "timeout"`. Exhausted Retry budgets coerce to
/// PartialSuccess when the node allows partial results, otherwise Fail.
///
/// Returns the final outcome and the number of attempts used.
#[allow(clippy::too_many_arguments)]
pub async fn execute_with_retry(
    handler: &SharedNodeHandler,
    node: &Node,
    context: &ContextStore,
    graph: &Graph,
    preamble: &Preamble,
    cancel: &CancellationToken,
    max_retries: u32,
    backoff: &BackoffConfig,
    seed: u64,
    on_retry: &mut dyn FnMut(u32, &str),
) -> (Outcome, u32) {
    let max_attempts = max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let attempt_cancel = cancel.child_token();

        let call = handler.execute(node, context, graph, preamble, &attempt_cancel);
        let result = match node.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(inner) => inner,
                Err(_) => {
                    attempt_cancel.cancel();
                    return (Outcome::fail("timeout"), attempt);
                }
            },
            None => call.await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let reason = error.to_string();
                if attempt < max_attempts && !cancel.is_cancelled() {
                    on_retry(attempt, &reason);
                    tokio::time::sleep(delay_for_attempt(attempt, backoff, seed)).await;
                    continue;
                }
                return (Outcome::fail(reason), attempt);
            }
        };

        if outcome.status == StageStatus::Retry {
            if attempt < max_attempts && !cancel.is_cancelled() {
                let reason = outcome
                    .notes
                    .clone()
                    .unwrap_or_else(|| "handler requested retry".to_string());
                on_retry(attempt, &reason);
                tokio::time::sleep(delay_for_attempt(attempt, backoff, seed)).await;
                continue;
            }
            return (finalize_exhausted(node, outcome), attempt);
        }

        return (outcome, attempt);
    }
}

/// Retry budget ran out while the handler still wanted to retry.
fn finalize_exhausted(node: &Node, outcome: Outcome) -> Outcome {
    if node.allow_partial {
        return Outcome {
            status: StageStatus::PartialSuccess,
            notes: Some(
                outcome
                    .notes
                    .unwrap_or_else(|| "retries exhausted; accepting partial result".to_string()),
            ),
            ..outcome
        };
    }
    Outcome {
        status: StageStatus::Fail,
        failure_reason: Some(
            outcome
                .failure_reason
                .unwrap_or_else(|| "retries exhausted".to_string()),
        ),
        ..outcome
    }
}
