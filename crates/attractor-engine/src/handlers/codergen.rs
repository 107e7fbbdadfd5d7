use crate::handlers::NodeHandler;
use crate::{ContextStore, Graph, Node, Outcome, Preamble, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const RESPONSE_EXCERPT_CHARS: usize = 200;

/// What a generative backend hands back: either raw text (wrapped in a
/// Success outcome) or a fully-formed outcome with its own routing hints.
pub enum BackendReply {
    Text(String),
    Outcome(Outcome),
}

/// The injected generative collaborator.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn run(
        &self,
        node: &Node,
        prompt: &str,
        preamble: &Preamble,
        cancel: &CancellationToken,
    ) -> Result<BackendReply>;
}

/// Stand-in backend for dry runs and tests.
#[derive(Debug, Default)]
pub struct SimulationBackend;

#[async_trait]
impl Backend for SimulationBackend {
    async fn run(
        &self,
        node: &Node,
        _prompt: &str,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<BackendReply> {
        Ok(BackendReply::Text(format!(
            "simulated response for stage {}",
            node.id
        )))
    }
}

pub struct CodergenHandler {
    backend: Arc<dyn Backend>,
}

impl CodergenHandler {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulationBackend))
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextStore,
        graph: &Graph,
        preamble: &Preamble,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let template = node
            .prompt
            .clone()
            .unwrap_or_else(|| node.display_label().to_string());
        let prompt = expand_prompt(&template, &graph.goal, context)?;

        let mut outcome = match self.backend.run(node, &prompt, preamble, cancel).await? {
            BackendReply::Outcome(outcome) => outcome,
            BackendReply::Text(response) => {
                let mut outcome =
                    Outcome::success_with_notes(format!("stage {} completed", node.id));
                outcome.context_updates.insert(
                    "last_response".to_string(),
                    Value::String(excerpt(&response)),
                );
                outcome
            }
        };

        outcome
            .context_updates
            .insert("last_stage".to_string(), Value::String(node.id.clone()));
        if !outcome.context_updates.contains_key("last_response") {
            if let Some(notes) = outcome.notes.as_deref() {
                outcome
                    .context_updates
                    .insert("last_response".to_string(), Value::String(excerpt(notes)));
            }
        }

        Ok(outcome)
    }
}

/// Substitute `$goal` and `${key}` context variables in a prompt.
fn expand_prompt(template: &str, goal: &str, context: &ContextStore) -> Result<String> {
    let mut prompt = template.replace("$goal", goal);
    if prompt.contains("${") {
        for (key, value) in context.values()? {
            let token = format!("${{{key}}}");
            if prompt.contains(&token) {
                let replacement = match &value {
                    Value::String(inner) => inner.clone(),
                    other => other.to_string(),
                };
                prompt = prompt.replace(&token, &replacement);
            }
        }
    }
    Ok(prompt)
}

fn excerpt(response: &str) -> String {
    response.chars().take(RESPONSE_EXCERPT_CHARS).collect()
}
