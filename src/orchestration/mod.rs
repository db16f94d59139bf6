//! Orchestration layer for workflow runs.
//!
//! This module provides the components that execute a validated workflow:
//! the agent invocation contract, the scheduler that dispatches tasks and
//! applies retries, skips and cancellation, and the controller that ties a
//! run together.

mod controller;
mod invoker;
mod scheduler;

pub use controller::{
    ControllerOptions, ExecutionController, DEFAULT_CONCURRENCY, DEFAULT_GRACE_PERIOD,
};
pub use invoker::{
    AgentInvoker, CommandInvoker, InvocationRequest, InvokeError, TRANSIENT_EXIT_CODE,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, SchedulerOutcome, TaskFailure};
