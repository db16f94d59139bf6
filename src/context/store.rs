//! Versioned key/value context shared by the tasks of one run.
//!
//! Every key carries a monotonically increasing version and a full write
//! history. Access is checked against the task's selectors from the graph,
//! and each key's merge policy decides what a second write means.

use crate::context::policy::MergePolicy;
use crate::core::dag::WorkflowGraph;
use crate::core::task::{TaskId, TaskNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Flat key/value map: a task's input slice or an agent's returned outputs.
pub type ContextMap = BTreeMap<String, Value>;

/// Serializable view of the current entry of every key.
pub type ContextSnapshot = BTreeMap<String, ContextEntry>;

/// Whether a denied access was a read or a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Task {task} may not {access} key {key}")]
    AccessDenied {
        task: TaskId,
        key: String,
        access: Access,
    },

    #[error("Key {key} is exclusive to {holder} but {writer} also wrote it")]
    VersionConflict {
        key: String,
        holder: TaskId,
        writer: TaskId,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Context is sealed; the run has finished")]
    Sealed,
}

/// One committed value of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    /// Task that wrote the value; `None` for initial context.
    pub writer: Option<TaskId>,
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

/// Versioned context for one run.
///
/// Created fresh per run from the graph's initial context. Writes go
/// through [`ContextStore::commit`], which validates every key of a task's
/// output before applying any of them.
#[derive(Debug)]
pub struct ContextStore {
    graph: Arc<WorkflowGraph>,
    current: BTreeMap<String, ContextEntry>,
    history: BTreeMap<String, Vec<ContextEntry>>,
    sealed: bool,
}

impl ContextStore {
    /// Create a store seeded with the graph's initial context.
    pub fn new(graph: Arc<WorkflowGraph>) -> Self {
        let mut store = Self {
            graph,
            current: BTreeMap::new(),
            history: BTreeMap::new(),
            sealed: false,
        };
        let initial: Vec<(String, Value)> = store
            .graph
            .initial_context()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in initial {
            store.apply(&key, value, None);
        }
        store
    }

    /// Write an initial value with no writer task.
    ///
    /// Seeded values are readable by any task whose selector names the key
    /// and never count as the owner of an exclusive key.
    pub fn seed(&mut self, key: &str, value: Value) -> Result<u64, ContextError> {
        if self.sealed {
            return Err(ContextError::Sealed);
        }
        Ok(self.apply(key, value, None))
    }

    /// Read the latest committed value of a key on behalf of a task.
    ///
    /// Returns `Ok(None)` when the task may read the key but nothing has
    /// been written yet.
    pub fn read(&self, task: &TaskId, key: &str) -> Result<Option<Value>, ContextError> {
        let node = self.task(task)?;
        if !node.can_read(key) {
            return Err(ContextError::AccessDenied {
                task: task.clone(),
                key: key.to_string(),
                access: Access::Read,
            });
        }
        Ok(self.current.get(key).map(|e| e.value.clone()))
    }

    /// The input slice of a task: every key in its input selector that has
    /// a committed value.
    pub fn slice(&self, task: &TaskId) -> Result<ContextMap, ContextError> {
        let node = self.task(task)?;
        let mut slice = ContextMap::new();
        for key in &node.inputs {
            if let Some(value) = self.read(task, key)? {
                slice.insert(key.clone(), value);
            }
        }
        Ok(slice)
    }

    /// Write a single key. Equivalent to committing a one-key output.
    pub fn write(&mut self, task: &TaskId, key: &str, value: Value) -> Result<u64, ContextError> {
        let mut outputs = ContextMap::new();
        outputs.insert(key.to_string(), value);
        let versions = self.commit(task, outputs)?;
        Ok(versions.get(key).copied().unwrap_or_default())
    }

    /// Atomically commit a task's outputs.
    ///
    /// Every key is checked first; on any error nothing is written.
    /// Returns the new version of each written key.
    pub fn commit(
        &mut self,
        task: &TaskId,
        outputs: ContextMap,
    ) -> Result<BTreeMap<String, u64>, ContextError> {
        if self.sealed {
            return Err(ContextError::Sealed);
        }
        let node = self.task(task)?;
        for key in outputs.keys() {
            if !node.can_write(key) {
                return Err(ContextError::AccessDenied {
                    task: task.clone(),
                    key: key.clone(),
                    access: Access::Write,
                });
            }
            self.check_conflict(task, key)?;
        }

        let mut versions = BTreeMap::new();
        for (key, value) in outputs {
            let version = self.apply(&key, value, Some(task.clone()));
            versions.insert(key, version);
        }
        Ok(versions)
    }

    fn check_conflict(&self, task: &TaskId, key: &str) -> Result<(), ContextError> {
        if self.graph.merge_policy(key) != MergePolicy::Exclusive {
            return Ok(());
        }
        let holder = self
            .history
            .get(key)
            .into_iter()
            .flatten()
            .find_map(|e| e.writer.as_ref().filter(|w| *w != task));
        match holder {
            Some(holder) => Err(ContextError::VersionConflict {
                key: key.to_string(),
                holder: holder.clone(),
                writer: task.clone(),
            }),
            None => Ok(()),
        }
    }

    fn apply(&mut self, key: &str, value: Value, writer: Option<TaskId>) -> u64 {
        let version = self.version(key) + 1;
        let committed_at = Utc::now();
        let current_value = match self.graph.merge_policy(key) {
            MergePolicy::Append => {
                let mut items = match self.current.get(key).map(|e| &e.value) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.push(value.clone());
                Value::Array(items)
            }
            MergePolicy::Exclusive | MergePolicy::LastWriteWins => value.clone(),
        };
        trace!(key, version, writer = ?writer, "context write");

        self.history
            .entry(key.to_string())
            .or_default()
            .push(ContextEntry {
                key: key.to_string(),
                value,
                writer: writer.clone(),
                version,
                committed_at,
            });
        self.current.insert(
            key.to_string(),
            ContextEntry {
                key: key.to_string(),
                value: current_value,
                writer,
                version,
                committed_at,
            },
        );
        version
    }

    fn task(&self, id: &TaskId) -> Result<&TaskNode, ContextError> {
        self.graph
            .get_task(id)
            .ok_or_else(|| ContextError::UnknownTask(id.clone()))
    }

    /// Current entry of a key, without access checks.
    pub fn current(&self, key: &str) -> Option<&ContextEntry> {
        self.current.get(key)
    }

    /// Current value of a key, without access checks.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.current.get(key).map(|e| &e.value)
    }

    /// Latest version of a key; 0 if never written.
    pub fn version(&self, key: &str) -> u64 {
        self.current.get(key).map(|e| e.version).unwrap_or(0)
    }

    /// Every write of a key in commit order.
    pub fn history(&self, key: &str) -> &[ContextEntry] {
        self.history.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.current.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.current.clone()
    }

    /// Refuse every further commit. Called once the run is terminal.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}
