//! Per-run task execution states.

use crate::core::dag::WorkflowGraph;
use crate::core::task::{TaskExecutionState, TaskId, TaskStatus};
use std::collections::HashMap;

/// One `TaskExecutionState` per task of a graph, kept in declaration order.
///
/// Created fresh for every run; only the scheduler mutates it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStates {
    states: Vec<TaskExecutionState>,
    index: HashMap<TaskId, usize>,
}

impl ExecutionStates {
    /// Pending states for every task of the graph.
    pub fn new(graph: &WorkflowGraph) -> Self {
        let states: Vec<TaskExecutionState> = graph
            .tasks()
            .map(|task| TaskExecutionState::new(task.id.clone()))
            .collect();
        let index = states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.task_id.clone(), i))
            .collect();
        Self { states, index }
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskExecutionState> {
        self.index.get(id).map(|&i| &self.states[i])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskExecutionState> {
        self.index.get(id).map(|&i| &mut self.states[i])
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(|s| s.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskExecutionState> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Ids of tasks currently in the given status, in declaration order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.states
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.task_id.clone())
            .collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.states.iter().filter(|s| s.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_finished())
    }

    pub fn into_vec(self) -> Vec<TaskExecutionState> {
        self.states
    }
}
