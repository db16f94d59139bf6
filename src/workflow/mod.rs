//! Run identity, status and results.

mod result;
mod types;

pub use result::RunResult;
pub use types::{RunId, RunStatus};
