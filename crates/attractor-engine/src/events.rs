use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pipeline.start")]
    PipelineStart,
    #[serde(rename = "pipeline.complete")]
    PipelineComplete,
    #[serde(rename = "pipeline.error")]
    PipelineError,
    #[serde(rename = "pipeline.finalize")]
    PipelineFinalize,
    #[serde(rename = "node.start")]
    NodeStart,
    #[serde(rename = "node.complete")]
    NodeComplete,
    #[serde(rename = "node.retry")]
    NodeRetry,
    #[serde(rename = "goal_gate.retry")]
    GoalGateRetry,
    #[serde(rename = "loop.restart")]
    LoopRestart,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStart => "pipeline.start",
            Self::PipelineComplete => "pipeline.complete",
            Self::PipelineError => "pipeline.error",
            Self::PipelineFinalize => "pipeline.finalize",
            Self::NodeStart => "node.start",
            Self::NodeComplete => "node.complete",
            Self::NodeRetry => "node.retry",
            Self::GoalGateRetry => "goal_gate.retry",
            Self::LoopRestart => "loop.restart",
        }
    }
}

/// One entry of the run's event stream. Emission is synchronous with
/// engine state transitions; `sequence` is monotonic within a run and
/// `pipeline.finalize` is always last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub sequence: u64,
    pub timestamp: f64,
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub data: Map<String, Value>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &PipelineEvent) {}
}

/// Buffers every event in memory; the test suite's workhorse.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

impl<F> EventSink for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn emit(&self, event: &PipelineEvent) {
        self(event);
    }
}

/// Forwards events into a tokio channel for streaming consumers.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) {
        let _ = self.sender.send(event.clone());
    }
}

pub fn event_channel() -> (
    mpsc::UnboundedSender<PipelineEvent>,
    mpsc::UnboundedReceiver<PipelineEvent>,
) {
    mpsc::unbounded_channel()
}
