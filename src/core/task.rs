//! Task data model for the workflow graph.
//!
//! A `TaskNode` is the immutable description of one unit of work: which
//! agent runs it, what it may read and write, and how failures are retried.
//! A `TaskExecutionState` tracks what happened to that task during one run.

use crate::context::MergePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-attempt invocation timeout (5 minutes).
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Identifier of a task, unique within one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A context key a task may write, with its declared merge policy.
///
/// In a definition this is either a bare key (`"draft"`, policy left
/// undeclared) or a table (`{ key = "score", merge = "append" }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OutputKeyRepr", into = "OutputKeyRepr")]
pub struct OutputKey {
    pub key: String,
    /// `None` when the definition did not declare a policy. The key then
    /// behaves as `exclusive` and may not be shared with a concurrent task.
    pub merge: Option<MergePolicy>,
}

impl OutputKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            merge: None,
        }
    }

    pub fn with_merge(key: impl Into<String>, merge: MergePolicy) -> Self {
        Self {
            key: key.into(),
            merge: Some(merge),
        }
    }

    /// The policy the store enforces for this key.
    pub fn effective_merge(&self) -> MergePolicy {
        self.merge.unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OutputKeyRepr {
    Bare(String),
    Declared {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<MergePolicy>,
    },
}

impl From<OutputKeyRepr> for OutputKey {
    fn from(repr: OutputKeyRepr) -> Self {
        match repr {
            OutputKeyRepr::Bare(key) => Self { key, merge: None },
            OutputKeyRepr::Declared { key, merge } => Self { key, merge },
        }
    }
}

impl From<OutputKey> for OutputKeyRepr {
    fn from(out: OutputKey) -> Self {
        match out.merge {
            None => OutputKeyRepr::Bare(out.key),
            merge => OutputKeyRepr::Declared {
                key: out.key,
                merge,
            },
        }
    }
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Double the delay after every attempt, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = initial_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// How many times a task is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocation attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One task of a workflow. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    /// Agent role the invoker resolves to a concrete agent.
    pub agent: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Context keys the task may read.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Context keys the task may write.
    #[serde(default)]
    pub outputs: Vec<OutputKey>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// When `false` the task still runs after a dependency failed or was
    /// skipped, with that dependency's outputs absent from its inputs.
    #[serde(default = "default_skip_on_dependency_failure")]
    pub skip_on_dependency_failure: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_skip_on_dependency_failure() -> bool {
    true
}

impl TaskNode {
    /// Create a task with no dependencies, selectors or retries.
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            agent: agent.into(),
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            skip_on_dependency_failure: true,
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(TaskId::new(dep));
        self
    }

    pub fn reads(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn writes(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(OutputKey::new(key));
        self
    }

    pub fn writes_with(mut self, key: impl Into<String>, merge: MergePolicy) -> Self {
        self.outputs.push(OutputKey::with_merge(key, merge));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn run_on_dependency_failure(mut self) -> Self {
        self.skip_on_dependency_failure = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn can_read(&self, key: &str) -> bool {
        self.inputs.iter().any(|k| k == key)
    }

    pub fn can_write(&self, key: &str) -> bool {
        self.output(key).is_some()
    }

    pub fn output(&self, key: &str) -> Option<&OutputKey> {
        self.outputs.iter().find(|o| o.key == key)
    }
}

/// Task status in its lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a dispatch slot (or a retry backoff).
    Ready,
    /// An invocation is in flight.
    Running,
    Succeeded,
    Failed,
    /// Not run because a dependency failed or was skipped.
    Skipped,
    /// Not finished when the run was cancelled or aborted.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// Terminal without having succeeded.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to one task during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionState {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Number of invocations dispatched so far.
    pub attempts: u32,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TaskExecutionState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Begin a new attempt.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self) {
        self.status = TaskStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    /// Return a failed attempt to the ready queue for another try.
    pub fn requeue(&mut self, error: &str) {
        self.status = TaskStatus::Ready;
        self.last_error = Some(error.to_string());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped;
        self.last_error = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time between first start and finish, if both happened.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
