pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod workflow;

pub use crate::core::{WorkflowDefinition, WorkflowGraph};
pub use error::{Error, Result};
pub use orchestration::{AgentInvoker, ControllerOptions, ExecutionController};
pub use workflow::{RunResult, RunStatus};
