//! Run-level type definitions.

use crate::core::states::ExecutionStates;
use crate::core::task::TaskStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one run of a workflow.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task succeeded.
    Completed,
    /// Some tasks succeeded and some did not.
    PartiallyFailed,
    /// No task succeeded, or the run hit a fatal context conflict.
    Failed,
    /// The run was cancelled before every task finished.
    Cancelled,
}

impl RunStatus {
    /// Derive the run status from the final task states.
    ///
    /// A fatal error always fails the run. A cancellation only counts when
    /// it actually stopped a task.
    pub fn from_states(states: &ExecutionStates, fatal: bool, cancelled: bool) -> Self {
        if fatal {
            return RunStatus::Failed;
        }
        if cancelled && states.count(TaskStatus::Cancelled) > 0 {
            return RunStatus::Cancelled;
        }
        let succeeded = states.count(TaskStatus::Succeeded);
        if succeeded == states.len() {
            RunStatus::Completed
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::PartiallyFailed => write!(f, "partially_failed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}
