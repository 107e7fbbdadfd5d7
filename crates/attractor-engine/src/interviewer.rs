use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuestionType {
    YesNo,
    MultipleChoice,
    Freeform,
    Confirmation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Choice {
    /// Shortcut key, e.g. `Y` for a `[Y] Yes` edge label.
    pub key: String,
    pub label: String,
    /// Node the matching edge leads to.
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub stage: String,
    pub text: String,
    pub question_type: QuestionType,
    pub choices: Vec<Choice>,
    pub default_choice: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Answer {
    Selected(String),
    Yes,
    No,
    Text(String),
    Timeout,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedExchange {
    pub question: Question,
    pub answer: Answer,
}

/// The human-decision collaborator for `wait.human` nodes.
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: Question) -> Answer;

    async fn ask_multiple(&self, questions: Vec<Question>) -> Vec<Answer> {
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            answers.push(self.ask(question).await);
        }
        answers
    }
}

/// Picks the first option, answers yes, and echoes a stock free-text
/// reply. Useful for unattended runs and tests.
#[derive(Debug, Default)]
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        match question.question_type {
            QuestionType::YesNo | QuestionType::Confirmation => Answer::Yes,
            QuestionType::MultipleChoice => question
                .choices
                .first()
                .map(|choice| Answer::Selected(choice.key.clone()))
                .unwrap_or(Answer::Skipped),
            QuestionType::Freeform => Answer::Text("approved".to_string()),
        }
    }
}

/// Pops pre-filled answers in FIFO order; answers `Skipped` when empty.
#[derive(Default)]
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }

    pub fn push(&self, answer: Answer) {
        self.answers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(answer);
    }

    pub fn pending(&self) -> usize {
        self.answers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: Question) -> Answer {
        self.answers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Answer::Skipped)
    }
}

/// Delegates every question to a closure.
pub struct CallbackInterviewer {
    callback: Arc<dyn Fn(Question) -> Answer + Send + Sync>,
}

impl CallbackInterviewer {
    pub fn new(callback: impl Fn(Question) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl Interviewer for CallbackInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        (self.callback)(question)
    }
}

/// Wraps another interviewer and appends every exchange to a list.
pub struct RecordingInterviewer {
    inner: Arc<dyn Interviewer>,
    exchanges: Mutex<Vec<RecordedExchange>>,
}

impl RecordingInterviewer {
    pub fn new(inner: Arc<dyn Interviewer>) -> Self {
        Self {
            inner,
            exchanges: Mutex::new(Vec::new()),
        }
    }

    pub fn exchanges(&self) -> Vec<RecordedExchange> {
        self.exchanges
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        let answer = self.inner.ask(question.clone()).await;
        self.exchanges
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedExchange {
                question,
                answer: answer.clone(),
            });
        answer
    }
}

/// Prompts on the controlling terminal. Blocking reads run on the
/// blocking pool so the engine's executor is never stalled.
#[derive(Debug, Default)]
pub struct TerminalInterviewer;

#[async_trait]
impl Interviewer for TerminalInterviewer {
    async fn ask(&self, question: Question) -> Answer {
        match tokio::task::spawn_blocking(move || ask_on_terminal(question)).await {
            Ok(answer) => answer,
            Err(_) => Answer::Skipped,
        }
    }
}

fn ask_on_terminal(question: Question) -> Answer {
    eprintln!("[?] {}", question.text);
    match question.question_type {
        QuestionType::MultipleChoice => {
            for choice in &question.choices {
                eprintln!("  [{}] {}", choice.key, choice.label);
            }
            let Some(raw) = read_line("select: ") else {
                return Answer::Skipped;
            };
            if raw.is_empty() {
                return match question.default_choice {
                    Some(default_choice) => Answer::Selected(default_choice),
                    None => Answer::Skipped,
                };
            }
            Answer::Selected(raw)
        }
        QuestionType::YesNo | QuestionType::Confirmation => {
            let Some(raw) = read_line("[y/n]: ") else {
                return Answer::Skipped;
            };
            match raw.to_ascii_lowercase().as_str() {
                "y" | "yes" => Answer::Yes,
                "n" | "no" => Answer::No,
                _ => Answer::Skipped,
            }
        }
        QuestionType::Freeform => match read_line("> ") {
            Some(raw) => Answer::Text(raw),
            None => Answer::Skipped,
        },
    }
}

fn read_line(prompt: &str) -> Option<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}").ok()?;
    stderr.flush().ok()?;

    let mut raw = String::new();
    io::stdin().read_line(&mut raw).ok()?;
    Some(raw.trim().to_string())
}
