//! Core domain models for workflow orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: task nodes, the workflow definition, the validated
//! dependency graph and the per-run task states.

pub mod dag;
pub mod definition;
pub mod states;
pub mod task;

pub use dag::{GraphError, WorkflowGraph};
pub use definition::WorkflowDefinition;
pub use states::ExecutionStates;
pub use task::{
    Backoff, OutputKey, RetryPolicy, TaskExecutionState, TaskId, TaskNode, TaskStatus,
};
