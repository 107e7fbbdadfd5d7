use async_trait::async_trait;
use attractor_engine::handlers::codergen::{Backend, BackendReply, CodergenHandler};
use attractor_engine::handlers::core_registry;
use attractor_engine::{
    parse_dot, CollectingSink, EventKind, Node, Outcome, PipelineError, PipelineRunner,
    PipelineStatus, Preamble, Result, RunConfig, StageStatus,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct FixedBackend {
    response: &'static str,
}

#[async_trait]
impl Backend for FixedBackend {
    async fn run(
        &self,
        _node: &Node,
        _prompt: &str,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<BackendReply> {
        Ok(BackendReply::Text(self.response.to_string()))
    }
}

struct StatusBackend {
    status: StageStatus,
}

#[async_trait]
impl Backend for StatusBackend {
    async fn run(
        &self,
        _node: &Node,
        _prompt: &str,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<BackendReply> {
        let mut outcome = Outcome::success();
        outcome.status = self.status;
        if self.status == StageStatus::Fail {
            outcome.failure_reason = Some("scripted failure".to_string());
        }
        Ok(BackendReply::Outcome(outcome))
    }
}

fn config_with_backend(backend: Arc<dyn Backend>, sink: Arc<CollectingSink>) -> RunConfig {
    let mut registry = core_registry();
    registry.register("codergen", Arc::new(CodergenHandler::new(backend)));
    RunConfig {
        registry: Arc::new(registry),
        events: sink,
        ..RunConfig::default()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn linear_pipeline_expected_full_event_trace_and_context() {
    let graph = parse_dot(
        r#"
        digraph demo {
            graph [goal="G"]
            Start [shape=Mdiamond]
            A [shape=box, prompt="work on $goal"]
            Exit [shape=Msquare]
            Start -> A -> Exit
        }
        "#,
    )
    .expect("graph should parse");

    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(Arc::new(FixedBackend { response: "ok" }), sink.clone());

    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.completed_nodes,
        vec!["Start".to_string(), "A".to_string(), "Exit".to_string()]
    );
    assert_eq!(result.context.get("pipeline.goal"), Some(&json!("G")));
    assert_eq!(result.context.get("outcome"), Some(&json!("success")));
    assert_eq!(result.context.get("last_stage"), Some(&json!("A")));
    assert_eq!(result.context.get("last_response"), Some(&json!("ok")));

    let trace: Vec<(EventKind, Option<String>)> = sink
        .events()
        .into_iter()
        .map(|event| (event.kind, event.node_id))
        .collect();
    let expected = vec![
        (EventKind::PipelineStart, None),
        (EventKind::NodeStart, Some("Start".to_string())),
        (EventKind::NodeComplete, Some("Start".to_string())),
        (EventKind::NodeStart, Some("A".to_string())),
        (EventKind::NodeComplete, Some("A".to_string())),
        (EventKind::NodeStart, Some("Exit".to_string())),
        (EventKind::NodeComplete, Some("Exit".to_string())),
        (EventKind::PipelineComplete, None),
        (EventKind::PipelineFinalize, None),
    ];
    assert_eq!(trace, expected);

    // Sequence numbers are monotonic.
    let sequences: Vec<u64> = sink.events().iter().map(|event| event.sequence).collect();
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(flavor = "current_thread")]
async fn conditional_routing_expected_success_branch() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            C [shape=box, prompt="check"]
            Pass; Fail
            Exit [shape=Msquare]
            Start -> C
            C -> Pass [condition="outcome=success"]
            C -> Fail [condition="outcome=fail"]
            Pass -> Exit
            Fail -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(
        Arc::new(StatusBackend {
            status: StageStatus::Success,
        }),
        sink,
    );
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert!(result.completed_nodes.contains(&"Pass".to_string()));
    assert!(!result.completed_nodes.contains(&"Fail".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn conditional_routing_expected_fail_branch() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            C [shape=box, prompt="check"]
            Pass; Recover
            Exit [shape=Msquare]
            Start -> C
            C -> Pass [condition="outcome=success"]
            C -> Recover [condition="outcome=fail"]
            Pass -> Exit
            Recover -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    struct FailAtC;

    #[async_trait]
    impl Backend for FailAtC {
        async fn run(
            &self,
            node: &Node,
            _prompt: &str,
            _preamble: &Preamble,
            _cancel: &CancellationToken,
        ) -> Result<BackendReply> {
            if node.id == "C" {
                Ok(BackendReply::Outcome(Outcome::fail("no good")))
            } else {
                Ok(BackendReply::Text("fine".to_string()))
            }
        }
    }

    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(Arc::new(FailAtC), sink);
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert!(result.completed_nodes.contains(&"Recover".to_string()));
    assert!(!result.completed_nodes.contains(&"Pass".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn weighted_edges_expected_highest_weight_then_lexical() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            C [shape=box, prompt="check"]
            Heavy; Light
            Exit [shape=Msquare]
            Start -> C
            C -> Light [condition="outcome=success", weight=5]
            C -> Heavy [condition="outcome=success", weight=10]
            Heavy -> Exit
            Light -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");
    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(
        Arc::new(StatusBackend {
            status: StageStatus::Success,
        }),
        sink,
    );
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");
    assert!(result.completed_nodes.contains(&"Heavy".to_string()));

    // Equal weights: the lexicographically smaller target id wins.
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            C [shape=box, prompt="check"]
            beta; alpha
            Exit [shape=Msquare]
            Start -> C
            C -> beta [condition="outcome=success", weight=5]
            C -> alpha [condition="outcome=success", weight=5]
            alpha -> Exit
            beta -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");
    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(
        Arc::new(StatusBackend {
            status: StageStatus::Success,
        }),
        sink,
    );
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should succeed");
    assert!(result.completed_nodes.contains(&"alpha".to_string()));
    assert!(!result.completed_nodes.contains(&"beta".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn failing_node_without_route_expected_pipeline_error() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            Work [shape=box, prompt="w"]
            Next
            Exit [shape=Msquare]
            Start -> Work
            Work -> Next [condition="outcome=success"]
            Next -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    let sink = Arc::new(CollectingSink::new());
    let config = config_with_backend(
        Arc::new(StatusBackend {
            status: StageStatus::Fail,
        }),
        sink.clone(),
    );
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should finish");

    assert_eq!(result.status, PipelineStatus::Fail);
    let kinds = sink.kinds();
    assert!(kinds.contains(&EventKind::PipelineError));
    assert_eq!(kinds.last(), Some(&EventKind::PipelineFinalize));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_exhaustion_expected_bounded_retry_events() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            Flaky [shape=box, prompt="f", max_retries=2]
            Exit [shape=Msquare]
            Start -> Flaky -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    struct AlwaysRetry;

    #[async_trait]
    impl Backend for AlwaysRetry {
        async fn run(
            &self,
            node: &Node,
            _prompt: &str,
            _preamble: &Preamble,
            _cancel: &CancellationToken,
        ) -> Result<BackendReply> {
            if node.id == "Flaky" {
                Ok(BackendReply::Outcome(Outcome::retry("still flaky")))
            } else {
                Ok(BackendReply::Text("ok".to_string()))
            }
        }
    }

    let sink = Arc::new(CollectingSink::new());
    let mut config = config_with_backend(Arc::new(AlwaysRetry), sink.clone());
    config.backoff = attractor_engine::BackoffConfig {
        initial_delay_ms: 0,
        backoff_factor: 1.0,
        max_delay_ms: 0,
        jitter: false,
    };
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should finish");

    // Retry budget exhausted, allow_partial unset: the node records Fail,
    // and the unconditional edge still routes to the exit.
    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.node_outcomes.get("Flaky").map(|o| o.status),
        Some(StageStatus::Fail)
    );

    let retry_events: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|event| event.kind == EventKind::NodeRetry)
        .collect();
    assert_eq!(retry_events.len(), 2);
    assert_eq!(retry_events[0].data.get("attempt"), Some(&json!(1)));
    assert_eq!(retry_events[1].data.get("attempt"), Some(&json!(2)));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_exhaustion_allow_partial_expected_partial_success() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            Flaky [shape=box, prompt="f", max_retries=1, allow_partial=true]
            Exit [shape=Msquare]
            Start -> Flaky -> Exit
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    struct AlwaysRetry;

    #[async_trait]
    impl Backend for AlwaysRetry {
        async fn run(
            &self,
            node: &Node,
            _prompt: &str,
            _preamble: &Preamble,
            _cancel: &CancellationToken,
        ) -> Result<BackendReply> {
            if node.id == "Flaky" {
                Ok(BackendReply::Outcome(Outcome::retry("still flaky")))
            } else {
                Ok(BackendReply::Text("ok".to_string()))
            }
        }
    }

    let sink = Arc::new(CollectingSink::new());
    let mut config = config_with_backend(Arc::new(AlwaysRetry), sink);
    config.backoff = attractor_engine::BackoffConfig {
        initial_delay_ms: 0,
        backoff_factor: 1.0,
        max_delay_ms: 0,
        jitter: false,
    };
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should finish");

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.node_outcomes.get("Flaky").map(|o| o.status),
        Some(StageStatus::PartialSuccess)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn step_limit_expected_pipeline_error() {
    let dot = r#"
        digraph G {
            Start [shape=Mdiamond]
            A [shape=box, prompt="a"]
            B [shape=box, prompt="b"]
            Exit [shape=Msquare]
            Start -> A
            A -> B
            B -> A
            B -> Exit [condition="outcome=fail"]
        }
    "#;
    let graph = parse_dot(dot).expect("graph should parse");

    let sink = Arc::new(CollectingSink::new());
    let mut config = config_with_backend(Arc::new(FixedBackend { response: "ok" }), sink.clone());
    config.max_steps = 10;
    let result = PipelineRunner
        .run(&graph, config)
        .await
        .expect("run should finish");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert!(
        result
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("step limit"))
    );
    assert!(sink.kinds().contains(&EventKind::PipelineError));
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_graph_expected_validation_error_before_any_event() {
    let graph = parse_dot("digraph G { lonely }").expect("graph should parse");
    let sink = Arc::new(CollectingSink::new());
    let config = RunConfig {
        events: sink.clone(),
        ..RunConfig::default()
    };

    let error = PipelineRunner
        .run(&graph, config)
        .await
        .expect_err("run must be rejected");
    assert!(matches!(error, PipelineError::Validation(_)));
    assert!(sink.events().is_empty());
}
