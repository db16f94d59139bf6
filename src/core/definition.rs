//! Workflow definition documents.
//!
//! A definition is the serialized form a user writes: a name, optional
//! initial context values and the list of tasks. TOML and JSON are accepted,
//! chosen by file extension.

use crate::core::task::TaskNode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_name")]
    pub name: String,
    /// Context values present before any task runs.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub tasks: Vec<TaskNode>,
}

fn default_name() -> String {
    "workflow".to_string()
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            name: default_name(),
            context: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn task(mut self, task: TaskNode) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn seed(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a definition, picking the parser from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading workflow definition");
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(Error::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}
