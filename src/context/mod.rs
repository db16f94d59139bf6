//! Shared, versioned context for workflow runs.
//!
//! Tasks communicate only through the context: each task reads the keys in
//! its input selector and its committed outputs become visible to later
//! readers once its invocation has finished.

mod policy;
mod store;

pub use policy::MergePolicy;
pub use store::{
    Access, ContextEntry, ContextError, ContextMap, ContextSnapshot, ContextStore,
};
