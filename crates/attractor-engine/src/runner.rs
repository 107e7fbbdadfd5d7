use crate::handlers::parallel::{run_fan_out, FanOutOptions};
use crate::{
    build_preamble, build_resume_state, effective_max_retries, execute_with_retry,
    find_incoming_edge, jitter_seed, resolve_fidelity, resolve_thread_id, select_edge,
    validate_or_raise, Checkpoint, CheckpointStore, Clock, ContextMap, ContextStore, EventKind,
    FsCheckpointStore, Graph, Node, Outcome, PipelineError, PipelineEvent, PipelineStatus, Result,
    RunConfig, RunResult, SelectionStep, SharedEventSink, StageRecord, StageStatus,
};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Single-threaded orchestrator over one graph: visits nodes, applies
/// retry and goal-gate policy, selects edges, emits events, and persists
/// a checkpoint after every step.
#[derive(Debug, Default)]
pub struct PipelineRunner;

struct Emitter {
    sink: SharedEventSink,
    clock: Arc<dyn Clock>,
    sequence: u64,
}

impl Emitter {
    fn emit(&mut self, kind: EventKind, node_id: Option<&str>, data: Map<String, Value>) {
        self.sequence += 1;
        self.sink.emit(&PipelineEvent {
            sequence: self.sequence,
            timestamp: self.clock.now(),
            kind,
            node_id: node_id.map(ToOwned::to_owned),
            data,
        });
    }
}

struct LoopState {
    current: String,
    completed: Vec<StageRecord>,
    node_outcomes: IndexMap<String, Outcome>,
    node_retries: IndexMap<String, u32>,
    steps: u32,
}

enum LoopEnd {
    Complete,
    Error { reason: String, node_id: Option<String> },
    Cancelled,
}

enum Route {
    Next { target: String, loop_restart: bool },
    Terminal,
    Stuck(String),
}

impl PipelineRunner {
    pub async fn run(&self, graph: &Graph, config: RunConfig) -> Result<RunResult> {
        let graph = {
            let mut prepared = graph.clone();
            crate::apply_builtin_transforms(&mut prepared)?;
            prepared
        };
        let graph = &graph;
        validate_or_raise(graph, &[])?;

        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{}-run", graph.name));
        if let Some(root) = config.logs_root.as_ref() {
            fs::create_dir_all(root).map_err(|error| {
                PipelineError::Runtime(format!(
                    "failed to create logs root '{}': {error}",
                    root.display()
                ))
            })?;
        }
        let checkpoints: Option<Arc<dyn CheckpointStore>> =
            config.checkpoints.clone().or_else(|| {
                config
                    .logs_root
                    .as_ref()
                    .map(|root| Arc::new(FsCheckpointStore::in_dir(root)) as Arc<dyn CheckpointStore>)
            });

        let mut emitter = Emitter {
            sink: config.events.clone(),
            clock: config.clock.clone(),
            sequence: 0,
        };

        let seed = seed_context(graph);
        let mut context = ContextStore::from_values(seed.clone());
        let mut state = LoopState {
            current: String::new(),
            completed: Vec::new(),
            node_outcomes: IndexMap::new(),
            node_retries: IndexMap::new(),
            steps: 0,
        };

        let resumed = config.resume_from.is_some();
        if let Some(path) = config.resume_from.as_ref() {
            let checkpoint = Checkpoint::load(path)?;
            let resume = build_resume_state(graph, &checkpoint)?;
            context = ContextStore::from_values(resume.context);
            for entry in resume.logs {
                context.append_log(entry)?;
            }
            state.completed = resume.completed;
            state.node_outcomes = resume.node_outcomes;
            state.node_retries = resume.node_retries;
            state.current = resume.next_node_id;
        } else {
            state.current = start_node(graph)?.id.clone();
        }

        let mut start_data = Map::new();
        start_data.insert("pipeline".to_string(), json!(graph.name));
        start_data.insert("run_id".to_string(), json!(run_id));
        if resumed {
            start_data.insert("resumed".to_string(), json!(true));
        }
        emitter.emit(EventKind::PipelineStart, None, start_data);
        info!(run_id = %run_id, pipeline = %graph.name, "pipeline started");

        let end = self
            .drive(
                graph,
                &config,
                &run_id,
                &seed,
                &mut emitter,
                &mut context,
                &mut state,
                checkpoints.as_deref(),
            )
            .await?;

        let (status, failure_reason) = match end {
            LoopEnd::Complete => {
                emitter.emit(
                    EventKind::PipelineComplete,
                    None,
                    Map::from_iter([("pipeline".to_string(), json!(graph.name))]),
                );
                info!(run_id = %run_id, "pipeline completed");
                (PipelineStatus::Success, None)
            }
            LoopEnd::Error { reason, node_id } => {
                let mut data = Map::new();
                data.insert("reason".to_string(), json!(reason));
                emitter.emit(EventKind::PipelineError, node_id.as_deref(), data);
                warn!(run_id = %run_id, reason = %reason, "pipeline failed");
                (PipelineStatus::Fail, Some(reason))
            }
            LoopEnd::Cancelled => {
                info!(run_id = %run_id, "pipeline cancelled");
                (PipelineStatus::Cancelled, Some("cancelled".to_string()))
            }
        };

        let mut finalize_data = Map::new();
        finalize_data.insert("status".to_string(), json!(status.as_str()));
        if status == PipelineStatus::Cancelled {
            finalize_data.insert("cancelled".to_string(), json!(true));
        }
        emitter.emit(EventKind::PipelineFinalize, None, finalize_data);

        Ok(RunResult {
            run_id,
            status,
            failure_reason,
            completed_nodes: state
                .completed
                .iter()
                .map(|record| record.node_id.clone())
                .collect(),
            node_outcomes: state.node_outcomes,
            context: context.values()?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        graph: &Graph,
        config: &RunConfig,
        run_id: &str,
        seed: &ContextMap,
        emitter: &mut Emitter,
        context: &mut ContextStore,
        state: &mut LoopState,
        checkpoints: Option<&dyn CheckpointStore>,
    ) -> Result<LoopEnd> {
        loop {
            if config.cancel.is_cancelled() {
                save_checkpoint(checkpoints, &config.clock, state, context)?;
                return Ok(LoopEnd::Cancelled);
            }
            if state.steps >= config.max_steps {
                save_checkpoint(checkpoints, &config.clock, state, context)?;
                return Ok(LoopEnd::Error {
                    reason: format!("step limit of {} exceeded", config.max_steps),
                    node_id: Some(state.current.clone()),
                });
            }
            let Some(node) = graph.node(&state.current) else {
                return Ok(LoopEnd::Error {
                    reason: format!("traversal reached unknown node '{}'", state.current),
                    node_id: Some(state.current.clone()),
                });
            };
            state.steps += 1;

            let previous = state.completed.last().map(|record| record.node_id.clone());
            let incoming = find_incoming_edge(graph, &node.id, previous.as_deref());
            let fidelity = resolve_fidelity(graph, &node.id, incoming);
            let thread_id = resolve_thread_id(graph, &node.id, incoming, previous.as_deref());

            let mut start_data = Map::new();
            start_data.insert("fidelity".to_string(), json!(fidelity.as_str()));
            emitter.emit(EventKind::NodeStart, Some(&node.id), start_data);
            debug!(node_id = %node.id, fidelity = %fidelity, "visiting node");

            let preamble = build_preamble(
                fidelity,
                &graph.name,
                &graph.goal,
                thread_id,
                &state.completed,
                &context.values()?,
            );

            let handler_type = config.registry.resolve_type(node);
            let (outcome, attempts, fan_out_route) =
                if handler_type == "parallel" && !config.registry.has("parallel") {
                    let fan_out = run_fan_out(
                        node,
                        context,
                        graph,
                        &config.cancel,
                        FanOutOptions {
                            registry: config.registry.as_ref(),
                            backoff: &config.backoff,
                            run_id,
                            default_max_parallel: config.max_parallel,
                            max_branch_steps: config.max_steps,
                        },
                    )
                    .await?;
                    (fan_out.outcome, 1, Some(fan_out.continue_at))
                } else {
                    let Some(handler) = config.registry.resolve(node) else {
                        return Ok(LoopEnd::Error {
                            reason: format!("no handler registered for type '{handler_type}'"),
                            node_id: Some(node.id.clone()),
                        });
                    };
                    let mut on_retry = |attempt: u32, reason: &str| {
                        let mut data = Map::new();
                        data.insert("attempt".to_string(), json!(attempt));
                        data.insert("reason".to_string(), json!(reason));
                        emitter.emit(EventKind::NodeRetry, Some(&node.id), data);
                    };
                    let (outcome, attempts) = execute_with_retry(
                        &handler,
                        node,
                        context,
                        graph,
                        &preamble,
                        &config.cancel,
                        effective_max_retries(node, graph),
                        &config.backoff,
                        jitter_seed(run_id, &node.id),
                        &mut on_retry,
                    )
                    .await;
                    (outcome, attempts, None)
                };

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
            state.node_outcomes.insert(node.id.clone(), outcome.clone());
            state
                .node_retries
                .insert(node.id.clone(), attempts.saturating_sub(1));
            state.completed.push(StageRecord {
                node_id: node.id.clone(),
                status: outcome.status,
            });
            context.append_log(format!("{}: {}", node.id, outcome.status.as_str()))?;

            let mut complete_data = Map::new();
            complete_data.insert("status".to_string(), json!(outcome.status.as_str()));
            emitter.emit(EventKind::NodeComplete, Some(&node.id), complete_data);

            if Graph::is_exit_node(node) {
                match first_unsatisfied_gate(graph, &state.node_outcomes) {
                    Some(gate_id) => match resolve_retry_target(graph, &gate_id) {
                        Some(target) => {
                            let mut data = Map::new();
                            data.insert("gate".to_string(), json!(gate_id));
                            data.insert("target".to_string(), json!(target));
                            emitter.emit(EventKind::GoalGateRetry, Some(&gate_id), data);
                            debug!(gate = %gate_id, target = %target, "goal gate retry");
                            save_checkpoint(checkpoints, &config.clock, state, context)?;
                            state.current = target;
                            continue;
                        }
                        None => {
                            save_checkpoint(checkpoints, &config.clock, state, context)?;
                            return Ok(LoopEnd::Error {
                                reason: format!(
                                    "goal gate '{gate_id}' is unsatisfied and has no retry target"
                                ),
                                node_id: Some(gate_id),
                            });
                        }
                    },
                    None => {
                        save_checkpoint(checkpoints, &config.clock, state, context)?;
                        return Ok(LoopEnd::Complete);
                    }
                }
            }

            let route = match fan_out_route {
                Some(Some(target)) => Route::Next {
                    target,
                    loop_restart: false,
                },
                // Every branch ended at an exit or dead end; nothing left
                // to traverse from the fan-out.
                Some(None) => Route::Terminal,
                None => {
                    let snapshot = context.values()?;
                    match select_edge(graph, &node.id, &outcome, &snapshot) {
                        Some(selected) => {
                            if outcome.status == StageStatus::Fail
                                && selected.step == SelectionStep::AnyEdge
                            {
                                Route::Stuck(format!(
                                    "node '{}' failed with no matching outgoing edge",
                                    node.id
                                ))
                            } else {
                                Route::Next {
                                    target: selected.edge.to.clone(),
                                    loop_restart: selected.edge.loop_restart,
                                }
                            }
                        }
                        None => Route::Stuck(format!(
                            "node '{}' has no outgoing edges and is not an exit",
                            node.id
                        )),
                    }
                }
            };

            match route {
                Route::Next {
                    target,
                    loop_restart,
                } => {
                    if loop_restart {
                        let mut data = Map::new();
                        data.insert("target".to_string(), json!(target));
                        emitter.emit(EventKind::LoopRestart, Some(&node.id), data);
                        info!(target = %target, "loop restart");
                        *context = ContextStore::from_values(seed.clone());
                        state.completed.clear();
                        state.node_outcomes.clear();
                        state.node_retries.clear();
                    }
                    state.current = target;
                    save_checkpoint(checkpoints, &config.clock, state, context)?;
                }
                Route::Terminal => {
                    save_checkpoint(checkpoints, &config.clock, state, context)?;
                    return Ok(LoopEnd::Complete);
                }
                Route::Stuck(reason) => {
                    save_checkpoint(checkpoints, &config.clock, state, context)?;
                    return Ok(LoopEnd::Error {
                        reason,
                        node_id: Some(node.id.clone()),
                    });
                }
            }
        }
    }
}

fn seed_context(graph: &Graph) -> ContextMap {
    let mut seed = ContextMap::new();
    seed.insert("pipeline.name".to_string(), json!(graph.name));
    seed.insert("pipeline.goal".to_string(), json!(graph.goal));
    seed.insert("goal".to_string(), json!(graph.goal));
    seed
}

fn start_node(graph: &Graph) -> Result<&Node> {
    graph
        .start_candidates()
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::InvalidGraph("graph has no start node".to_string()))
}

/// Goal-gated nodes in declaration order; the first whose recorded
/// outcome is not success-like. Gates without a recorded outcome have not
/// run and do not block the exit.
fn first_unsatisfied_gate(
    graph: &Graph,
    node_outcomes: &IndexMap<String, Outcome>,
) -> Option<String> {
    graph
        .goal_gated_nodes()
        .find(|node| {
            node_outcomes
                .get(&node.id)
                .is_some_and(|outcome| !outcome.status.is_success_like())
        })
        .map(|node| node.id.clone())
}

/// Node retry targets first, then the graph-level equivalents; targets
/// must name existing nodes.
fn resolve_retry_target(graph: &Graph, gate_id: &str) -> Option<String> {
    let node = graph.node(gate_id)?;
    [
        node.retry_target.as_deref(),
        node.fallback_retry_target.as_deref(),
        graph.retry_target.as_deref(),
        graph.fallback_retry_target.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find(|target| graph.nodes.contains_key(*target))
    .map(ToOwned::to_owned)
}

fn save_checkpoint(
    store: Option<&dyn CheckpointStore>,
    clock: &Arc<dyn Clock>,
    state: &LoopState,
    context: &ContextStore,
) -> Result<()> {
    let Some(store) = store else {
        return Ok(());
    };
    let snapshot = context.snapshot()?;
    let checkpoint = Checkpoint {
        timestamp: clock.now(),
        current_node: state
            .completed
            .last()
            .map(|record| record.node_id.clone())
            .unwrap_or_default(),
        completed_nodes: state
            .completed
            .iter()
            .map(|record| record.node_id.clone())
            .collect(),
        node_retries: state.node_retries.clone(),
        context: snapshot.values,
        logs: snapshot.logs,
        node_statuses: state
            .completed
            .iter()
            .map(|record| (record.node_id.clone(), record.status.as_str().to_string()))
            .collect(),
    };
    store.save(&checkpoint)
}
