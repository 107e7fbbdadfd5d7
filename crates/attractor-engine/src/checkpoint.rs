use crate::{ContextMap, PipelineError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Wall-clock source for checkpoint and event timestamps.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// State persisted after every completed step, sufficient to resume a run
/// after a crash. Unknown fields are ignored on load and missing fields
/// default to empty, so the format is forward-compatible.
///
/// `node_statuses` supplements the core field set so goal-gate state
/// survives a resume; readers that do not know it can ignore it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub current_node: String,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub node_retries: IndexMap<String, u32>,
    #[serde(default)]
    pub context: ContextMap,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_statuses: IndexMap<String, String>,
}

impl Checkpoint {
    /// Write as pretty JSON via a temp file in the same directory followed
    /// by a rename, so a concurrent reader never observes a partial write.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| {
                PipelineError::Runtime(format!(
                    "failed to create checkpoint directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            PipelineError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        let temp = path.with_extension("json.tmp");
        fs::write(&temp, bytes).map_err(|error| {
            PipelineError::Runtime(format!(
                "failed to write checkpoint temp file '{}': {error}",
                temp.display()
            ))
        })?;
        fs::rename(&temp, path).map_err(|error| {
            PipelineError::Runtime(format!(
                "failed to move checkpoint into place at '{}': {error}",
                path.display()
            ))
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|error| {
            PipelineError::Runtime(format!(
                "failed to read checkpoint '{}': {error}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            PipelineError::Runtime(format!(
                "failed to decode checkpoint '{}': {error}",
                path.display()
            ))
        })
    }
}

/// Checkpoint persistence seam; the engine only ever talks to this trait.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn load(&self) -> Result<Option<Checkpoint>>;
}

#[derive(Clone, Debug)]
pub struct FsCheckpointStore {
    path: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(logs_root: &Path) -> Self {
        Self::new(logs_root.join(CHECKPOINT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.save(&self.path)
    }

    fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Checkpoint::load(&self.path).map(Some)
    }
}
