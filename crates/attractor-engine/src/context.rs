use crate::{PipelineError, Result};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Insertion-ordered key/value view of the context. Fidelity modes slice
/// "the first N entries", so ordering is part of the contract.
pub type ContextMap = IndexMap<String, Value>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextSnapshot {
    pub values: ContextMap,
    pub logs: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct ContextState {
    values: ContextMap,
    logs: Vec<String>,
}

/// The shared key/value store for one run. Reads are concurrent, writes
/// exclusive; `apply_updates` is atomic (all updates land under one write
/// lock or none do).
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextState>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: ContextMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                values,
                logs: Vec::new(),
            })),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let state = self
            .inner
            .read()
            .map_err(|_| PipelineError::Runtime("context read lock poisoned".to_string()))?;
        Ok(state.values.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| PipelineError::Runtime("context write lock poisoned".to_string()))?;
        state.values.insert(key.into(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| PipelineError::Runtime("context write lock poisoned".to_string()))?;
        state.values.shift_remove(key);
        Ok(())
    }

    pub fn apply_updates(&self, updates: &ContextMap) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut state = self
            .inner
            .write()
            .map_err(|_| PipelineError::Runtime("context write lock poisoned".to_string()))?;
        for (key, value) in updates {
            state.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn append_log(&self, entry: impl Into<String>) -> Result<()> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| PipelineError::Runtime("context write lock poisoned".to_string()))?;
        state.logs.push(entry.into());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot> {
        let state = self
            .inner
            .read()
            .map_err(|_| PipelineError::Runtime("context read lock poisoned".to_string()))?;
        Ok(ContextSnapshot {
            values: state.values.clone(),
            logs: state.logs.clone(),
        })
    }

    pub fn values(&self) -> Result<ContextMap> {
        Ok(self.snapshot()?.values)
    }

    /// Independent copy with fresh backing storage. Mutations on either
    /// side are invisible to the other.
    pub fn deep_clone(&self) -> Result<Self> {
        let snapshot = self.snapshot()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                values: snapshot.values,
                logs: snapshot.logs,
            })),
        })
    }
}
