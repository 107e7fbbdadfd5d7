use crate::handlers::NodeHandler;
use crate::{
    Answer, Choice, ContextStore, Graph, Interviewer, Node, Outcome, Preamble, Question,
    QuestionType, Result,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Human decision gate. The question comes from the node, the choices
/// from its outgoing edge labels; the selected choice routes by
/// `preferred_label`.
pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextStore,
        graph: &Graph,
        _preamble: &Preamble,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let choices = derive_choices(node, graph);
        if choices.is_empty() {
            return Ok(Outcome::fail("human gate has no outgoing edges"));
        }

        let question = Question {
            stage: node.id.clone(),
            text: node
                .prompt
                .clone()
                .unwrap_or_else(|| node.display_label().to_string()),
            question_type: QuestionType::MultipleChoice,
            choices: choices.clone(),
            default_choice: node.extra_str("human.default_choice").map(ToOwned::to_owned),
            timeout: node.timeout,
        };

        let answer = self.interviewer.ask(question).await;
        let selected = match answer {
            Answer::Selected(raw) => match find_choice(&choices, &raw) {
                Some(choice) => choice,
                None => choices[0].clone(),
            },
            Answer::Yes => choices[0].clone(),
            Answer::No if choices.len() > 1 => choices[1].clone(),
            Answer::No => choices[0].clone(),
            Answer::Text(raw) => match find_choice(&choices, &raw) {
                Some(choice) => choice,
                None => {
                    return Ok(Outcome::success_with_notes(raw));
                }
            },
            Answer::Timeout => {
                let fallback = node
                    .extra_str("human.default_choice")
                    .and_then(|raw| find_choice(&choices, raw));
                match fallback {
                    Some(choice) => choice,
                    None => return Ok(Outcome::retry("human gate timed out with no default")),
                }
            }
            Answer::Skipped => return Ok(Outcome::fail("human skipped the question")),
        };

        let mut outcome =
            Outcome::success_with_notes(format!("human selected {}", selected.key));
        outcome.preferred_label = Some(selected.label.clone());
        outcome.suggested_next_ids = vec![selected.target.clone()];
        outcome
            .context_updates
            .insert("human.selected".to_string(), Value::String(selected.key));
        outcome.context_updates.insert(
            "human.selected_label".to_string(),
            Value::String(selected.label),
        );
        Ok(outcome)
    }
}

fn derive_choices(node: &Node, graph: &Graph) -> Vec<Choice> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            let label = if edge.label.trim().is_empty() {
                edge.to.clone()
            } else {
                edge.label.clone()
            };
            Choice {
                key: accelerator_key(&label),
                label,
                target: edge.to.clone(),
            }
        })
        .collect()
}

/// Shortcut key from an accelerator prefix (`[X] `, `X) `, `X - `),
/// falling back to the first character.
fn accelerator_key(label: &str) -> String {
    let trimmed = label.trim();

    if let Some((key, _)) = trimmed
        .strip_prefix('[')
        .and_then(|inner| inner.split_once(']'))
    {
        let key = key.trim();
        if !key.is_empty() {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((key, _)) = trimmed.split_once(')') {
        if key.trim().len() == 1 {
            return key.trim().to_ascii_uppercase();
        }
    }
    if let Some((key, _)) = trimmed.split_once(" - ") {
        if key.trim().len() == 1 {
            return key.trim().to_ascii_uppercase();
        }
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn find_choice(choices: &[Choice], raw: &str) -> Option<Choice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.target.to_ascii_lowercase() == needle
        })
        .cloned()
}
