use crate::handlers::registry::HandlerRegistry;
use crate::{
    build_preamble, effective_max_retries, execute_with_retry, find_incoming_edge, jitter_seed,
    resolve_fidelity, resolve_thread_id, BackoffConfig, ContextMap, ContextStore, Graph, Node,
    Outcome, Result, SelectionStep, StageRecord, StageStatus, select_edge,
};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPolicy {
    WaitAll,
    FirstSuccess,
    KOfN(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorPolicy {
    Continue,
    FailFast,
    Ignore,
}

/// Engine-supplied wiring for a fan-out.
pub struct FanOutOptions<'a> {
    pub registry: &'a HandlerRegistry,
    pub backoff: &'a BackoffConfig,
    pub run_id: &'a str,
    pub default_max_parallel: usize,
    pub max_branch_steps: u32,
}

/// What the engine does after the fan-out: jump straight to the fan-in
/// node the branches converged on, or treat the fan-out as terminal.
pub struct FanOutResult {
    pub outcome: Outcome,
    pub continue_at: Option<String>,
}

#[derive(Clone, Debug)]
struct BranchSpec {
    index: usize,
    branch_id: String,
    target: String,
}

#[derive(Clone, Debug)]
struct BranchRecord {
    spec: BranchSpec,
    status: StageStatus,
    notes: Option<String>,
    score: Option<f64>,
    delta: ContextMap,
    fan_in: Option<String>,
}

/// Fan out the node's outgoing edges as concurrent sub-runs over isolated
/// context clones, bounded by `max_parallel`, and join them according to
/// the node's join and error policies.
pub async fn run_fan_out(
    node: &Node,
    context: &ContextStore,
    graph: &Graph,
    cancel: &CancellationToken,
    options: FanOutOptions<'_>,
) -> Result<FanOutResult> {
    let specs: Vec<BranchSpec> = graph
        .outgoing_edges(&node.id)
        .enumerate()
        .map(|(index, edge)| BranchSpec {
            index,
            branch_id: if edge.label.trim().is_empty() {
                edge.to.clone()
            } else {
                edge.label.clone()
            },
            target: edge.to.clone(),
        })
        .collect();

    if specs.is_empty() {
        return Ok(FanOutResult {
            outcome: Outcome::fail(format!("parallel node '{}' has no branches", node.id)),
            continue_at: None,
        });
    }

    let join_policy = match parse_join_policy(node) {
        Ok(policy) => policy,
        Err(reason) => {
            return Ok(FanOutResult {
                outcome: Outcome::fail(reason),
                continue_at: None,
            });
        }
    };
    let error_policy = parse_error_policy(node);
    let max_parallel = node
        .extra_i64("max_parallel")
        .and_then(|value| usize::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(options.default_max_parallel)
        .max(1);

    let branch_count = specs.len();
    let parent_values = context.values()?;
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let tokens: Vec<CancellationToken> =
        specs.iter().map(|_| cancel.child_token()).collect();

    debug!(
        node_id = %node.id,
        branches = branch_count,
        max_parallel,
        "starting parallel fan-out"
    );

    let mut pending: FuturesUnordered<_> = specs
        .iter()
        .zip(tokens.iter())
        .map(|(spec, token)| {
            let semaphore = Arc::clone(&semaphore);
            let parent_values = parent_values.clone();
            let registry = options.registry;
            let backoff = options.backoff;
            let run_id = options.run_id;
            let max_branch_steps = options.max_branch_steps;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return failed_record(spec, "branch scheduler shut down");
                };
                if token.is_cancelled() {
                    return skipped_record(spec);
                }

                let branch_context = ContextStore::from_values(parent_values.clone());
                let traversal = run_branch(
                    &node.id,
                    &spec.target,
                    &branch_context,
                    graph,
                    registry,
                    token,
                    backoff,
                    run_id,
                    max_branch_steps,
                )
                .await;

                let delta = context_delta(&parent_values, &branch_context);
                let score = delta.get("score").and_then(Value::as_f64);
                match traversal {
                    Ok(traversal) => BranchRecord {
                        spec: spec.clone(),
                        status: traversal.outcome.status,
                        notes: traversal.outcome.notes,
                        score,
                        delta,
                        fan_in: traversal.fan_in,
                    },
                    Err(error) => failed_record(spec, &error.to_string()),
                }
            }
        })
        .collect();

    let mut records: Vec<BranchRecord> = Vec::with_capacity(branch_count);
    let mut success_count = 0usize;
    let mut fail_count = 0usize;
    let mut early_verdict: Option<(StageStatus, String)> = None;

    while let Some(record) = pending.next().await {
        let succeeded = counts_as_success(record.status, error_policy);
        if succeeded {
            success_count += 1;
        } else {
            fail_count += 1;
        }
        debug!(
            branch = %record.spec.branch_id,
            status = record.status.as_str(),
            "parallel branch finished"
        );
        let failed = record.status == StageStatus::Fail;
        records.push(record);

        let stop = match join_policy {
            JoinPolicy::FirstSuccess if succeeded => Some((
                StageStatus::Success,
                "first branch success reached".to_string(),
            )),
            JoinPolicy::KOfN(k) if success_count >= k => Some((
                StageStatus::Success,
                format!("{success_count} of {branch_count} branches succeeded"),
            )),
            JoinPolicy::KOfN(k) if fail_count > branch_count - k => Some((
                StageStatus::Fail,
                format!("cannot reach {k} successes with {fail_count} failures"),
            )),
            _ if error_policy == ErrorPolicy::FailFast && failed => Some((
                StageStatus::Fail,
                "branch failed under fail_fast".to_string(),
            )),
            _ => None,
        };

        if let Some(verdict) = stop {
            if records.len() < branch_count {
                let finished: Vec<usize> =
                    records.iter().map(|record| record.spec.index).collect();
                for (index, token) in tokens.iter().enumerate() {
                    if !finished.contains(&index) {
                        token.cancel();
                    }
                }
            }
            early_verdict = Some(verdict);
            break;
        }
    }
    drop(pending);

    let (status, notes) = match early_verdict {
        Some(verdict) => verdict,
        None => match join_policy {
            JoinPolicy::WaitAll => {
                if success_count == branch_count {
                    (
                        StageStatus::Success,
                        format!("all {branch_count} branches succeeded"),
                    )
                } else {
                    (
                        StageStatus::PartialSuccess,
                        format!("{success_count} of {branch_count} branches succeeded"),
                    )
                }
            }
            JoinPolicy::FirstSuccess => {
                (StageStatus::Fail, "no branch succeeded".to_string())
            }
            JoinPolicy::KOfN(k) => (
                StageStatus::Fail,
                format!("only {success_count} of the required {k} branches succeeded"),
            ),
        },
    };

    records.sort_by_key(|record| record.spec.index);
    let continue_at = records.iter().find_map(|record| record.fan_in.clone());

    let mut outcome = Outcome {
        status,
        notes: Some(notes.clone()),
        ..Outcome::success()
    };
    if status == StageStatus::Fail {
        outcome.failure_reason = Some(notes);
    }
    outcome.context_updates.insert(
        "parallel.results".to_string(),
        Value::Array(records.iter().map(record_to_json).collect()),
    );
    outcome.context_updates.insert(
        "parallel.success_count".to_string(),
        json!(success_count),
    );
    outcome
        .context_updates
        .insert("parallel.fail_count".to_string(), json!(fail_count));

    Ok(FanOutResult {
        outcome,
        continue_at,
    })
}

struct BranchTraversal {
    outcome: Outcome,
    fan_in: Option<String>,
}

/// One branch: a single-threaded sub-run from the branch entry until a
/// fan-in node, an exit node, a failure with no route, or a dead end.
#[allow(clippy::too_many_arguments)]
async fn run_branch(
    fan_out_id: &str,
    entry: &str,
    context: &ContextStore,
    graph: &Graph,
    registry: &HandlerRegistry,
    cancel: &CancellationToken,
    backoff: &BackoffConfig,
    run_id: &str,
    max_steps: u32,
) -> Result<BranchTraversal> {
    let mut current = entry.to_string();
    let mut previous: Option<String> = Some(fan_out_id.to_string());
    let mut completed: Vec<StageRecord> = Vec::new();
    let mut last_outcome = Outcome::success();
    let mut steps = 0u32;

    loop {
        if cancel.is_cancelled() {
            last_outcome.status = StageStatus::Skipped;
            last_outcome.notes = Some("branch cancelled".to_string());
            return Ok(BranchTraversal {
                outcome: last_outcome,
                fan_in: None,
            });
        }
        if steps >= max_steps {
            return Ok(BranchTraversal {
                outcome: Outcome::fail("branch step limit exceeded"),
                fan_in: None,
            });
        }
        steps += 1;

        let Some(node) = graph.node(&current) else {
            return Ok(BranchTraversal {
                outcome: Outcome::fail(format!("branch reached unknown node '{current}'")),
                fan_in: None,
            });
        };

        let handler_type = registry.resolve_type(node);
        if handler_type == "parallel.fan_in" {
            return Ok(BranchTraversal {
                outcome: last_outcome,
                fan_in: Some(current),
            });
        }
        if Graph::is_exit_node(node) {
            return Ok(BranchTraversal {
                outcome: last_outcome,
                fan_in: None,
            });
        }
        if handler_type == "parallel" && !registry.has("parallel") {
            return Ok(BranchTraversal {
                outcome: Outcome::fail("nested fan-out inside a branch is not supported"),
                fan_in: None,
            });
        }

        let Some(handler) = registry.resolve(node) else {
            return Ok(BranchTraversal {
                outcome: Outcome::fail(format!(
                    "no handler registered for type '{handler_type}'"
                )),
                fan_in: None,
            });
        };

        let incoming = find_incoming_edge(graph, &current, previous.as_deref());
        let fidelity = resolve_fidelity(graph, &current, incoming);
        let thread_id = resolve_thread_id(graph, &current, incoming, previous.as_deref());
        let snapshot = context.values()?;
        let preamble = build_preamble(
            fidelity,
            &graph.name,
            &graph.goal,
            thread_id,
            &completed,
            &snapshot,
        );

        let (outcome, _attempts) = execute_with_retry(
            &handler,
            node,
            context,
            graph,
            &preamble,
            cancel,
            effective_max_retries(node, graph),
            backoff,
            jitter_seed(run_id, &format!("{fan_out_id}:{current}")),
            &mut |_, _| {},
        )
        .await;

        context.apply_updates(&outcome.context_updates)?;
        context.set(
            "outcome",
            Value::String(outcome.status.as_str().to_string()),
        )?;
        if let Some(label) = outcome.preferred_label.as_deref() {
            if !label.is_empty() {
                context.set("preferred_label", Value::String(label.to_string()))?;
            }
        }
        completed.push(StageRecord {
            node_id: current.clone(),
            status: outcome.status,
        });

        let selection = select_edge(graph, &current, &outcome, &context.values()?);
        last_outcome = outcome;

        match selection {
            Some(selected) => {
                if last_outcome.status == StageStatus::Fail
                    && selected.step == SelectionStep::AnyEdge
                {
                    return Ok(BranchTraversal {
                        outcome: last_outcome,
                        fan_in: None,
                    });
                }
                previous = Some(current);
                current = selected.edge.to.clone();
            }
            None => {
                return Ok(BranchTraversal {
                    outcome: last_outcome,
                    fan_in: None,
                });
            }
        }
    }
}

fn parse_join_policy(node: &Node) -> std::result::Result<JoinPolicy, String> {
    match node.extra_str("join_policy").unwrap_or("wait_all").trim() {
        "first_success" => Ok(JoinPolicy::FirstSuccess),
        "k_of_n" => {
            let k = node
                .extra_i64("k")
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    format!(
                        "parallel node '{}' uses k_of_n without a positive k",
                        node.id
                    )
                })?;
            Ok(JoinPolicy::KOfN(k as usize))
        }
        _ => Ok(JoinPolicy::WaitAll),
    }
}

fn parse_error_policy(node: &Node) -> ErrorPolicy {
    match node.extra_str("error_policy").unwrap_or("continue").trim() {
        "fail_fast" => ErrorPolicy::FailFast,
        "ignore" => ErrorPolicy::Ignore,
        _ => ErrorPolicy::Continue,
    }
}

fn counts_as_success(status: StageStatus, error_policy: ErrorPolicy) -> bool {
    status.is_success_like() || (error_policy == ErrorPolicy::Ignore && !status.is_success_like())
}

fn context_delta(parent: &ContextMap, branch: &ContextStore) -> ContextMap {
    let Ok(values) = branch.values() else {
        return ContextMap::new();
    };
    values
        .into_iter()
        .filter(|(key, value)| parent.get(key) != Some(value))
        .collect()
}

fn failed_record(spec: &BranchSpec, reason: &str) -> BranchRecord {
    BranchRecord {
        spec: spec.clone(),
        status: StageStatus::Fail,
        notes: Some(reason.to_string()),
        score: None,
        delta: ContextMap::new(),
        fan_in: None,
    }
}

fn skipped_record(spec: &BranchSpec) -> BranchRecord {
    BranchRecord {
        spec: spec.clone(),
        status: StageStatus::Skipped,
        notes: Some("cancelled before start".to_string()),
        score: None,
        delta: ContextMap::new(),
        fan_in: None,
    }
}

fn record_to_json(record: &BranchRecord) -> Value {
    json!({
        "branch_id": record.spec.branch_id,
        "target": record.spec.target,
        "status": record.status.as_str(),
        "score": record.score,
        "notes": record.notes,
        "context": Value::Object(
            record
                .delta
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
    })
}
