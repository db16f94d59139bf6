//! Merge policies for context keys.

use serde::{Deserialize, Serialize};

/// How concurrent or repeated writes to one context key are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// One writer task per run. A second writer is a definition error.
    #[default]
    Exclusive,
    /// The most recently committed write is the current value.
    LastWriteWins,
    /// Every write is kept; the current value is the ordered list of writes.
    Append,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::Exclusive => write!(f, "exclusive"),
            MergePolicy::LastWriteWins => write!(f, "last-write-wins"),
            MergePolicy::Append => write!(f, "append"),
        }
    }
}
