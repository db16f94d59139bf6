//! Scheduler for parallel task execution.
//!
//! The Scheduler drives one run of a [`WorkflowGraph`]: it promotes tasks
//! whose dependencies are done, dispatches ready tasks to the
//! [`AgentInvoker`] up to the concurrency limit, commits finished outputs
//! to the [`ContextStore`], and applies retries, skips and cancellation.
//! Every state change is reported as a [`SchedulerEvent`].

use crate::context::{ContextError, ContextMap, ContextStore};
use crate::core::dag::WorkflowGraph;
use crate::core::states::ExecutionStates;
use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::invoker::{AgentInvoker, InvocationRequest, InvokeError};
use crate::workflow::RunStatus;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow callers (the CLI progress output, tests) to react
/// to task state changes without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// An invocation was dispatched.
    TaskStarted { task_id: TaskId, attempt: u32 },
    /// Outputs were committed and the task succeeded.
    TaskSucceeded { task_id: TaskId, keys: Vec<String> },
    /// An attempt failed and the task will be dispatched again after `delay`.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskFailed { task_id: TaskId, error: String },
    /// The task will not run because `cause` did not succeed.
    TaskSkipped { task_id: TaskId, cause: TaskId },
    TaskCancelled { task_id: TaskId },
    /// The run reached a terminal status.
    RunFinished { status: RunStatus },
}

/// Why a single attempt of a task failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    AccessDenied(ContextError),

    #[error("Protocol violation: agent returned keys outside its output selector: {}", .keys.join(", "))]
    ProtocolViolation { keys: Vec<String> },
}

impl TaskFailure {
    /// Only timeouts and transient invoker failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskFailure::Invoke(e) if e.is_retryable())
    }
}

/// Limits applied to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of invocations in flight.
    pub concurrency: usize,
    /// How long in-flight invocations may finish after cancellation.
    pub grace_period: Duration,
    /// Replaces every task's own timeout when set.
    pub timeout_override: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            grace_period: Duration::from_secs(10),
            timeout_override: None,
        }
    }
}

/// How the scheduling loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedulerOutcome {
    /// Context conflict that aborted the run.
    pub fatal: Option<ContextError>,
    /// Whether cancellation was requested.
    pub cancelled: bool,
}

/// Result of one invocation, produced by the spawned invocation task.
struct Completion {
    task_id: TaskId,
    attempt: u32,
    result: Result<ContextMap, InvokeError>,
}

/// Scheduler for parallel task execution.
///
/// The store and the state set are owned by the caller and shared here;
/// the scheduler only mutates them, it never replaces them.
pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    store: Arc<RwLock<ContextStore>>,
    states: Arc<RwLock<ExecutionStates>>,
    invoker: Arc<dyn AgentInvoker>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    /// Invocations currently running.
    in_flight: JoinSet<Completion>,
    /// Ready tasks waiting out a retry backoff.
    backoff_until: HashMap<TaskId, Instant>,
    fatal: Option<ContextError>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        store: Arc<RwLock<ContextStore>>,
        states: Arc<RwLock<ExecutionStates>>,
        invoker: Arc<dyn AgentInvoker>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph,
            store,
            states,
            invoker,
            config,
            cancel,
            event_tx: None,
            in_flight: JoinSet::new(),
            backoff_until: HashMap::new(),
            fatal: None,
        }
    }

    /// Report lifecycle changes on the given channel.
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Run the scheduling loop until every task is terminal.
    ///
    /// Each pass:
    /// 1. Skips tasks whose dependencies did not succeed, then promotes
    ///    Pending tasks to Ready
    /// 2. Dispatches Ready tasks up to the concurrency limit
    /// 3. Waits for an invocation to finish, a backoff to expire or
    ///    cancellation
    pub async fn run(&mut self) -> SchedulerOutcome {
        info!(
            workflow = self.graph.name(),
            tasks = self.graph.task_count(),
            concurrency = self.concurrency(),
            "scheduler started"
        );

        loop {
            if self.cancel.is_cancelled() {
                self.shutdown().await;
                break;
            }

            self.evaluate_readiness().await;
            let dispatched = self.dispatch_ready_tasks().await;

            if self.in_flight.is_empty() && self.backoff_until.is_empty() {
                if dispatched > 0 {
                    continue;
                }
                if !self.states.read().await.all_terminal() {
                    warn!("no runnable tasks remain; cancelling the rest");
                    self.cancel_tasks(|_| true).await;
                }
                break;
            }

            let retry_at = self.backoff_until.values().min().copied();
            let has_slot = self.in_flight.len() < self.concurrency();

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Some(completion) = Self::completion(joined) {
                        self.handle_completion(completion).await;
                    }
                    if self.fatal.is_some() {
                        self.abandon_in_flight().await;
                        self.cancel_tasks(|_| true).await;
                        break;
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() && has_slot => {}
            }
        }

        info!(workflow = self.graph.name(), "scheduler finished");
        SchedulerOutcome {
            fatal: self.fatal.take(),
            cancelled: self.cancel.is_cancelled(),
        }
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Apply dependency skips until none remain, then promote ready tasks.
    async fn evaluate_readiness(&mut self) {
        let mut events = Vec::new();
        {
            let mut states = self.states.write().await;
            loop {
                let skips = self.graph.skippable_tasks(&states);
                if skips.is_empty() {
                    break;
                }
                for (task_id, cause) in skips {
                    if let Some(state) = states.get_mut(&task_id) {
                        state.skip(&format!("dependency {} did not succeed", cause));
                    }
                    info!(task = %task_id, cause = %cause, "task skipped");
                    events.push(SchedulerEvent::TaskSkipped { task_id, cause });
                }
            }

            for task_id in self.graph.ready_tasks(&states) {
                if let Some(state) = states.get_mut(&task_id) {
                    state.mark_ready();
                }
                debug!(task = %task_id, "task ready");
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Dispatch Ready tasks whose backoff has elapsed, in declaration
    /// order, up to the free capacity. Returns the number of tasks whose
    /// state changed.
    pub async fn dispatch_ready_tasks(&mut self) -> usize {
        let slots = self.concurrency().saturating_sub(self.in_flight.len());
        if slots == 0 {
            return 0;
        }

        let now = Instant::now();
        let ready: Vec<TaskId> = {
            let states = self.states.read().await;
            states
                .with_status(TaskStatus::Ready)
                .into_iter()
                .filter(|id| self.backoff_until.get(id).map_or(true, |at| *at <= now))
                .take(slots)
                .collect()
        };

        let dispatched = ready.len();
        for task_id in ready {
            self.backoff_until.remove(&task_id);
            self.dispatch(task_id).await;
        }
        dispatched
    }

    async fn dispatch(&mut self, task_id: TaskId) {
        let (agent, timeout) = match self.graph.get_task(&task_id) {
            Some(node) => (
                node.agent.clone(),
                self.config.timeout_override.unwrap_or_else(|| node.timeout()),
            ),
            None => return,
        };

        let sliced = self.store.read().await.slice(&task_id);
        let inputs = match sliced {
            Ok(inputs) => inputs,
            Err(err) => {
                let failure = TaskFailure::AccessDenied(err);
                self.finish_failed(&task_id, &failure.to_string()).await;
                return;
            }
        };

        let (attempt, degraded) = {
            let mut states = self.states.write().await;
            let degraded = self.graph.unsuccessful_dependencies(&task_id, &states);
            match states.get_mut(&task_id) {
                Some(state) => {
                    state.start();
                    (state.attempts, degraded)
                }
                None => return,
            }
        };

        debug!(
            task = %task_id,
            agent = %agent,
            attempt,
            inputs = inputs.len(),
            timeout_ms = timeout.as_millis() as u64,
            "dispatching task"
        );

        let request = InvocationRequest {
            task_id: task_id.clone(),
            agent,
            inputs,
            timeout_ms: timeout.as_millis() as u64,
            attempt,
            degraded_dependencies: degraded,
        };
        let invoker = Arc::clone(&self.invoker);
        let id = task_id.clone();
        self.in_flight.spawn(async move {
            // `invoke` itself is called inside the guard so a panic raised
            // before the future is returned still fails this task.
            let invocation =
                async move { tokio::time::timeout(timeout, invoker.invoke(request)).await };
            let result = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(InvokeError::Timeout(timeout)),
                Err(_panic) => Err(InvokeError::Rejected("agent invoker panicked".to_string())),
            };
            Completion {
                task_id: id,
                attempt,
                result,
            }
        });

        self.emit(SchedulerEvent::TaskStarted { task_id, attempt });
    }

    fn completion(joined: Result<Completion, JoinError>) -> Option<Completion> {
        match joined {
            Ok(completion) => Some(completion),
            Err(err) => {
                warn!(error = %err, "invocation task did not complete");
                None
            }
        }
    }

    /// Handle a finished invocation.
    async fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            task_id,
            attempt,
            result,
        } = completion;
        match result {
            Ok(outputs) => self.handle_outputs(task_id, attempt, outputs).await,
            Err(err) => {
                self.handle_failure(task_id, attempt, TaskFailure::Invoke(err))
                    .await
            }
        }
    }

    /// Validate returned outputs against the task's selector and commit them.
    async fn handle_outputs(&mut self, task_id: TaskId, attempt: u32, outputs: ContextMap) {
        let extra: Vec<String> = match self.graph.get_task(&task_id) {
            Some(node) => outputs
                .keys()
                .filter(|key| !node.can_write(key))
                .cloned()
                .collect(),
            None => return,
        };
        if !extra.is_empty() {
            let failure = TaskFailure::ProtocolViolation { keys: extra };
            self.handle_failure(task_id, attempt, failure).await;
            return;
        }

        let keys: Vec<String> = outputs.keys().cloned().collect();
        let committed = self.store.write().await.commit(&task_id, outputs);
        match committed {
            Ok(versions) => {
                if let Some(state) = self.states.write().await.get_mut(&task_id) {
                    state.succeed();
                }
                info!(task = %task_id, attempt, ?versions, "task succeeded");
                self.emit(SchedulerEvent::TaskSucceeded { task_id, keys });
            }
            Err(err @ ContextError::VersionConflict { .. }) => {
                warn!(task = %task_id, error = %err, "exclusive key conflict; aborting run");
                self.finish_failed(&task_id, &err.to_string()).await;
                self.fatal = Some(err);
            }
            Err(err @ ContextError::AccessDenied { .. }) => {
                self.handle_failure(task_id, attempt, TaskFailure::AccessDenied(err))
                    .await
            }
            Err(err) => self.finish_failed(&task_id, &err.to_string()).await,
        }
    }

    /// Handle a failed attempt: requeue with backoff, or fail the task.
    async fn handle_failure(&mut self, task_id: TaskId, attempt: u32, failure: TaskFailure) {
        let error = failure.to_string();
        let retry = self
            .graph
            .get_task(&task_id)
            .map(|node| node.retry)
            .unwrap_or_default();

        if !(failure.is_retryable() && retry.allows_retry(attempt)) {
            warn!(task = %task_id, attempt, error = %error, "task failed");
            self.finish_failed(&task_id, &error).await;
            return;
        }

        // Retries are not started once cancellation has been requested.
        if self.cancel.is_cancelled() {
            self.cancel_tasks_by_id(vec![task_id]).await;
            return;
        }

        let delay = retry.backoff.delay(attempt);
        if let Some(state) = self.states.write().await.get_mut(&task_id) {
            state.requeue(&error);
        }
        self.backoff_until
            .insert(task_id.clone(), Instant::now() + delay);
        warn!(
            task = %task_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "task attempt failed; retrying"
        );
        self.emit(SchedulerEvent::TaskRetrying {
            task_id,
            attempt,
            delay,
            error,
        });
    }

    async fn finish_failed(&mut self, task_id: &TaskId, error: &str) {
        if let Some(state) = self.states.write().await.get_mut(task_id) {
            state.fail(error);
        }
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        });
    }

    /// Stop dispatching, give in-flight invocations the grace period to
    /// finish, then abandon the rest.
    async fn shutdown(&mut self) {
        info!(
            in_flight = self.in_flight.len(),
            grace_ms = self.config.grace_period.as_millis() as u64,
            "cancellation requested"
        );
        self.cancel_tasks(|status| status != TaskStatus::Running)
            .await;

        let deadline = Instant::now() + self.config.grace_period;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next()).await {
                Ok(Some(joined)) => {
                    if let Some(completion) = Self::completion(joined) {
                        self.handle_completion(completion).await;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = self.in_flight.len(),
                        "grace period elapsed; abandoning invocations"
                    );
                    break;
                }
            }
        }

        self.abandon_in_flight().await;
        self.cancel_tasks(|_| true).await;
    }

    /// Abort every in-flight invocation and wait until they are dropped.
    async fn abandon_in_flight(&mut self) {
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
    }

    /// Cancel every non-terminal task whose status matches.
    async fn cancel_tasks(&mut self, select: impl Fn(TaskStatus) -> bool) {
        let ids: Vec<TaskId> = self
            .states
            .read()
            .await
            .iter()
            .filter(|s| !s.is_finished() && select(s.status))
            .map(|s| s.task_id.clone())
            .collect();
        self.cancel_tasks_by_id(ids).await;
    }

    async fn cancel_tasks_by_id(&mut self, ids: Vec<TaskId>) {
        {
            let mut states = self.states.write().await;
            for id in &ids {
                if let Some(state) = states.get_mut(id) {
                    state.cancel();
                }
            }
        }
        for task_id in ids {
            self.backoff_until.remove(&task_id);
            debug!(task = %task_id, "task cancelled");
            self.emit(SchedulerEvent::TaskCancelled { task_id });
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
