//! Final result of a run and its JSON report.

use crate::context::ContextSnapshot;
use crate::core::task::{TaskExecutionState, TaskId, TaskStatus};
use crate::error::Result;
use crate::workflow::types::{RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Everything a caller learns about a finished run.
///
/// Serializes as the run report: run id, workflow name, status, fatal
/// error, per-task states and the final context snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    /// Error that aborted the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final state of every task, in declaration order.
    pub tasks: Vec<TaskExecutionState>,
    pub context: ContextSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn task(&self, id: &TaskId) -> Option<&TaskExecutionState> {
        self.tasks.iter().find(|t| &t.task_id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the pretty-printed report, creating parent directories.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Report file name inside a report directory.
    ///
    /// The workflow name is reduced to `[A-Za-z0-9_-]` so the file always
    /// lands directly in `dir`.
    pub fn report_path(&self, dir: &Path) -> PathBuf {
        let name: String = self
            .workflow
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.is_empty() { "workflow" } else { &name };
        dir.join(format!("{}-{}.json", name, self.run_id.short()))
    }

    /// Human-readable summary for the terminal.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Workflow {} [{}] {} in {}ms",
            self.workflow,
            self.run_id.short(),
            self.status,
            self.duration().num_milliseconds()
        );
        for task in &self.tasks {
            let _ = write!(
                out,
                "  {:<20} {:<10} attempts={}",
                task.task_id.as_str(),
                task.status.to_string(),
                task.attempts
            );
            if let Some(err) = task.last_error.as_deref() {
                if task.status != TaskStatus::Succeeded {
                    let _ = write!(out, "  {}", err);
                }
            }
            out.push('\n');
        }
        if let Some(err) = &self.error {
            let _ = writeln!(out, "Run aborted: {}", err);
        }
        out
    }
}
