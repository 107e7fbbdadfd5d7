use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, PipelineError, Preamble, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolExecution {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// The injected shell-command collaborator.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolExecution>;
}

/// Runs commands through `sh -c` as child processes of this engine.
#[derive(Debug, Default)]
pub struct LocalProcessRunner;

#[async_trait]
impl ToolRunner for LocalProcessRunner {
    async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolExecution> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                PipelineError::Runtime(format!("failed to spawn tool command: {error}"))
            })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            result = &mut wait => result.map_err(|error| {
                PipelineError::Runtime(format!("tool command did not finish: {error}"))
            })?,
            _ = sleep_or_forever(timeout) => {
                // Dropping the pinned wait future reaps the child via
                // kill_on_drop.
                return Ok(ToolExecution {
                    timed_out: true,
                    ..ToolExecution::default()
                });
            }
            _ = cancel.cancelled() => {
                return Err(PipelineError::Runtime("tool execution cancelled".to_string()));
            }
        };

        Ok(ToolExecution {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            timed_out: false,
        })
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Executes the node's `tool_command` and maps the exit status onto the
/// outcome: zero is Success, anything else (including timeout) is Fail.
pub struct ToolHandler {
    runner: Arc<dyn ToolRunner>,
}

impl ToolHandler {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextStore,
        _graph: &Graph,
        _preamble: &Preamble,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let command = node.extra_str("tool_command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(Outcome::fail(format!(
                "tool node '{}' has no tool_command",
                node.id
            )));
        }

        let execution = self.runner.exec(command, node.timeout, cancel).await?;
        if execution.timed_out {
            return Ok(Outcome::fail("timeout"));
        }

        let mut updates = crate::ContextMap::new();
        updates.insert(
            "tool.output".to_string(),
            Value::String(execution.stdout.clone()),
        );

        match execution.exit_code {
            Some(0) => Ok(Outcome {
                notes: Some(format!("tool command completed: {command}")),
                context_updates: updates,
                ..Outcome::success()
            }),
            code => {
                let mut outcome = Outcome::fail(match code {
                    Some(code) => format!("tool command exited with status {code}"),
                    None => "tool command terminated by signal".to_string(),
                });
                outcome.context_updates = updates;
                if !execution.stderr.is_empty() {
                    outcome.notes = Some(execution.stderr);
                }
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_dot, StageStatus};

    fn tool_graph(command: &str) -> Graph {
        parse_dot(&format!(
            r#"digraph G {{ t [shape=parallelogram, tool_command="{command}"] }}"#
        ))
        .expect("graph should parse")
    }

    async fn run_tool(graph: &Graph) -> Outcome {
        let node = graph.node("t").expect("tool node should exist");
        let handler = ToolHandler::new(Arc::new(LocalProcessRunner));
        handler
            .execute(
                node,
                &ContextStore::new(),
                graph,
                &Preamble::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("execute should succeed")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_handler_success_expected_stdout_in_context() {
        let graph = tool_graph("echo hello");
        let outcome = run_tool(&graph).await;

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome
                .context_updates
                .get("tool.output")
                .and_then(Value::as_str),
            Some("hello\n")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_handler_nonzero_exit_expected_fail_with_reason() {
        let graph = tool_graph("exit 3");
        let outcome = run_tool(&graph).await;

        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(
            outcome.failure_reason.as_deref(),
            Some("tool command exited with status 3")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_handler_missing_command_expected_fail() {
        let graph = parse_dot("digraph G { t [shape=parallelogram] }").expect("graph should parse");
        let outcome = run_tool(&graph).await;
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_handler_timeout_expected_fail_with_timeout_reason() {
        let graph = parse_dot(
            r#"digraph G { t [shape=parallelogram, tool_command="sleep 5", timeout=100ms] }"#,
        )
        .expect("graph should parse");
        let outcome = run_tool(&graph).await;

        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("timeout"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn local_runner_cancel_expected_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = LocalProcessRunner
            .exec("sleep 5", None, &cancel)
            .await
            .expect_err("cancelled execution should error");
        assert!(result.to_string().contains("cancelled"));
    }
}
