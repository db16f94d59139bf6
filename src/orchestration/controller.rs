//! Top-level entry point for running a workflow.
//!
//! The controller builds the graph, creates a fresh context store and state
//! set for every run, drives the [`Scheduler`] and folds the outcome into a
//! [`RunResult`].

use crate::config::Config;
use crate::context::ContextStore;
use crate::core::dag::WorkflowGraph;
use crate::core::definition::WorkflowDefinition;
use crate::core::states::ExecutionStates;
use crate::error::Result;
use crate::orchestration::invoker::AgentInvoker;
use crate::orchestration::scheduler::{Scheduler, SchedulerConfig, SchedulerEvent};
use crate::workflow::{RunId, RunResult, RunStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default number of concurrent invocations.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default time in-flight invocations get to finish after cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Settings shared by every run of a controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub concurrency: usize,
    pub grace_period: Duration,
    /// Replaces every task's timeout when set.
    pub timeout_override: Option<Duration>,
    /// Receives scheduler lifecycle events when set.
    pub events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            grace_period: DEFAULT_GRACE_PERIOD,
            timeout_override: None,
            events: None,
        }
    }
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.effective_concurrency(),
            grace_period: config.effective_grace_period(),
            ..Self::default()
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    pub fn events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Runs workflows against an injected [`AgentInvoker`].
///
/// Cancellation is cooperative: once [`ExecutionController::cancel`] is
/// called (or the token from [`ExecutionController::cancellation_token`]
/// is cancelled) the active run stops dispatching, gives in-flight
/// invocations the grace period, then marks everything unfinished
/// Cancelled. A cancelled token stays cancelled, so later runs on the same
/// controller end immediately.
pub struct ExecutionController {
    invoker: Arc<dyn AgentInvoker>,
    options: ControllerOptions,
    cancel: CancellationToken,
}

impl ExecutionController {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            options: ControllerOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// Token that cancels runs of this controller.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Validate a definition and run it with the given concurrency limit.
    ///
    /// An invalid definition fails here, before any agent is invoked.
    pub async fn run(&self, definition: WorkflowDefinition, concurrency: usize) -> Result<RunResult> {
        let graph = Arc::new(WorkflowGraph::build(definition)?);
        Ok(self.execute(graph, concurrency).await)
    }

    /// Run a pre-built graph with the configured concurrency.
    pub async fn run_graph(&self, graph: Arc<WorkflowGraph>) -> RunResult {
        self.execute(graph, self.options.concurrency).await
    }

    async fn execute(&self, graph: Arc<WorkflowGraph>, concurrency: usize) -> RunResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(
            run = %run_id.short(),
            workflow = graph.name(),
            tasks = graph.task_count(),
            "run started"
        );

        let store = Arc::new(RwLock::new(ContextStore::new(Arc::clone(&graph))));
        let states = Arc::new(RwLock::new(ExecutionStates::new(&graph)));
        let config = SchedulerConfig {
            concurrency,
            grace_period: self.options.grace_period,
            timeout_override: self.options.timeout_override,
        };

        let mut scheduler = Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&store),
            Arc::clone(&states),
            Arc::clone(&self.invoker),
            config,
            self.cancel.clone(),
        );
        if let Some(events) = &self.options.events {
            scheduler = scheduler.with_events(events.clone());
        }
        let outcome = scheduler.run().await;

        let context = {
            let mut store = store.write().await;
            store.seal();
            store.snapshot()
        };
        let states = states.read().await.clone();
        let status = RunStatus::from_states(&states, outcome.fatal.is_some(), outcome.cancelled);

        if let Some(events) = &self.options.events {
            let _ = events.send(SchedulerEvent::RunFinished { status });
        }
        info!(run = %run_id.short(), workflow = graph.name(), %status, "run finished");

        RunResult {
            run_id,
            workflow: graph.name().to_string(),
            status,
            error: outcome.fatal.map(|e| e.to_string()),
            tasks: states.into_vec(),
            context,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
