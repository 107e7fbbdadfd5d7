use crate::handlers::registry::HandlerRegistry;
use crate::{
    BackoffConfig, CheckpointStore, Clock, ContextMap, NullSink, Outcome, SharedEventSink,
    SystemClock,
};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_STEPS: u32 = 1000;

/// Everything a run needs beyond the graph. All collaborator seams have
/// working defaults: the built-in registry, a discarding event sink, the
/// system clock, and no checkpointing until a logs root is configured.
#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub registry: Arc<HandlerRegistry>,
    pub events: SharedEventSink,
    pub clock: Arc<dyn Clock>,
    pub logs_root: Option<PathBuf>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub resume_from: Option<PathBuf>,
    pub backoff: BackoffConfig,
    pub max_steps: u32,
    pub max_parallel: usize,
    pub cancel: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            registry: Arc::new(crate::handlers::core_registry()),
            events: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            logs_root: None,
            checkpoints: None,
            resume_from: None,
            backoff: BackoffConfig::default(),
            max_steps: DEFAULT_MAX_STEPS,
            max_parallel: crate::handlers::parallel::DEFAULT_MAX_PARALLEL,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    Fail,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: PipelineStatus,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: IndexMap<String, Outcome>,
    pub context: ContextMap,
}
