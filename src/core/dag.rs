//! Workflow graph (Directed Acyclic Graph) for dependency management.
//!
//! `WorkflowGraph` holds the tasks of one definition in a petgraph arena.
//! Nodes are inserted in declaration order, so a node's index doubles as its
//! declaration position and gives the scheduler a deterministic tie-break.
//! An edge `A -> B` means B depends on A. The graph is validated once in
//! [`WorkflowGraph::build`] and is read-only afterwards.

use crate::context::MergePolicy;
use crate::core::definition::WorkflowDefinition;
use crate::core::states::ExecutionStates;
use crate::core::task::{TaskId, TaskNode, TaskStatus};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use thiserror::Error;

/// Reasons a definition cannot be turned into a graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task {0} depends on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected at task: {0}")]
    Cycle(String),

    #[error("Task {task} declares output key {key} more than once")]
    DuplicateOutput { task: String, key: String },

    #[error(
        "Tasks {first} and {second} may run concurrently and both write {key} without a declared merge policy"
    )]
    OutputOverlap {
        key: String,
        first: String,
        second: String,
    },

    #[error(
        "Tasks {first} and {second} both write exclusive key {key}; declare a shared merge policy"
    )]
    ExclusiveRewrite {
        key: String,
        first: String,
        second: String,
    },

    #[error("Key {key} is declared {first} by one task and {second} by another")]
    ConflictingMergePolicy {
        key: String,
        first: MergePolicy,
        second: MergePolicy,
    },

    #[error("Task {0} must allow at least one attempt")]
    InvalidRetry(String),
}

/// The validated task dependency graph of one workflow.
pub struct WorkflowGraph {
    name: String,
    graph: DiGraph<TaskNode, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Stable topological order (declaration order breaks ties).
    order: Vec<NodeIndex>,
    merge_policies: HashMap<String, MergePolicy>,
    initial_context: BTreeMap<String, Value>,
}

impl WorkflowGraph {
    /// Validate a definition and build its graph.
    ///
    /// # Errors
    /// Returns a [`GraphError`] for duplicate ids, unknown or self
    /// dependencies, cycles, zero-attempt retry policies, and output keys
    /// that concurrent tasks share without agreeing on a merge policy.
    pub fn build(definition: WorkflowDefinition) -> Result<Self, GraphError> {
        let WorkflowDefinition {
            name,
            context,
            tasks,
        } = definition;

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask(task.id.to_string()));
            }
            if task.retry.max_attempts == 0 {
                return Err(GraphError::InvalidRetry(task.id.to_string()));
            }
            for (i, out) in task.outputs.iter().enumerate() {
                if task.outputs[..i].iter().any(|o| o.key == out.key) {
                    return Err(GraphError::DuplicateOutput {
                        task: task.id.to_string(),
                        key: out.key.clone(),
                    });
                }
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(GraphError::SelfDependency(task.id.to_string()));
                }
                let dep_index =
                    task_index
                        .get(dep)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            task: task.id.to_string(),
                            dependency: dep.to_string(),
                        })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            if graph.find_edge(from, to).is_none() {
                graph.add_edge(from, to, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].id.to_string()))?;

        let mut dag = Self {
            name,
            order: stable_order(&graph),
            graph,
            task_index,
            merge_policies: HashMap::new(),
            initial_context: context,
        };
        dag.merge_policies = dag.resolve_merge_policies()?;
        dag.check_output_overlap()?;
        Ok(dag)
    }

    /// Every declaration of a key must agree on its policy.
    fn resolve_merge_policies(&self) -> Result<HashMap<String, MergePolicy>, GraphError> {
        let mut declared: HashMap<String, MergePolicy> = HashMap::new();
        for task in self.tasks() {
            for out in &task.outputs {
                let Some(merge) = out.merge else { continue };
                match declared.get(&out.key) {
                    Some(&existing) if existing != merge => {
                        return Err(GraphError::ConflictingMergePolicy {
                            key: out.key.clone(),
                            first: existing,
                            second: merge,
                        });
                    }
                    Some(_) => {}
                    None => {
                        declared.insert(out.key.clone(), merge);
                    }
                }
            }
        }
        for task in self.tasks() {
            for out in &task.outputs {
                declared.entry(out.key.clone()).or_default();
            }
        }
        Ok(declared)
    }

    fn check_output_overlap(&self) -> Result<(), GraphError> {
        let mut writers: BTreeMap<&str, Vec<(NodeIndex, bool)>> = BTreeMap::new();
        for index in self.graph.node_indices() {
            for out in &self.graph[index].outputs {
                writers
                    .entry(out.key.as_str())
                    .or_default()
                    .push((index, out.merge.is_some()));
            }
        }

        for (key, tasks) in writers {
            for (i, &(a, a_declared)) in tasks.iter().enumerate() {
                for &(b, b_declared) in &tasks[i + 1..] {
                    if a_declared && b_declared {
                        continue;
                    }
                    let first = self.graph[a].id.to_string();
                    let second = self.graph[b].id.to_string();
                    if self.indices_concurrent(a, b) {
                        return Err(GraphError::OutputOverlap {
                            key: key.to_string(),
                            first,
                            second,
                        });
                    }
                    // Ordered writers of an exclusive key conflict on every run.
                    if self.merge_policy(key) == MergePolicy::Exclusive {
                        return Err(GraphError::ExclusiveRewrite {
                            key: key.to_string(),
                            first,
                            second,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn indices_concurrent(&self, a: NodeIndex, b: NodeIndex) -> bool {
        a != b
            && !has_path_connecting(&self.graph, a, b, None)
            && !has_path_connecting(&self.graph, b, a, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    /// Declaration position of a task.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Tasks the given task depends on, in the order it declared them.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.get_task(id)
            .map(|task| {
                task.depends_on
                    .iter()
                    .filter_map(|dep| self.get_task(dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks that depend on the given task, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents.into_iter().map(|i| &self.graph[i]).collect()
    }

    /// Tasks in an order where every task follows all of its dependencies.
    /// Among tasks that are ready at the same point, the earliest declared
    /// goes first.
    pub fn topological_order(&self) -> Vec<&TaskNode> {
        self.order.iter().map(|&i| &self.graph[i]).collect()
    }

    /// True when neither task can reach the other, so both may be running
    /// at the same time.
    pub fn concurrently_runnable(&self, a: &TaskId, b: &TaskId) -> bool {
        match (self.task_index.get(a), self.task_index.get(b)) {
            (Some(&a), Some(&b)) => self.indices_concurrent(a, b),
            _ => false,
        }
    }

    /// The merge policy the store enforces for a key.
    pub fn merge_policy(&self, key: &str) -> MergePolicy {
        self.merge_policies.get(key).copied().unwrap_or_default()
    }

    pub fn initial_context(&self) -> &BTreeMap<String, Value> {
        &self.initial_context
    }

    // ========== Scheduling Operations ==========

    /// Get all Pending tasks whose dependencies allow them to run.
    ///
    /// With the default policy every dependency must have Succeeded. A task
    /// that opted out of skip-on-dependency-failure only needs every
    /// dependency to be terminal. Returned in declaration order.
    pub fn ready_tasks(&self, states: &ExecutionStates) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if states.status(&task.id) != Some(TaskStatus::Pending) {
                    return None;
                }
                let mut deps = self.dependency_statuses(index, states);
                let ready = if task.skip_on_dependency_failure {
                    deps.all(|s| s == TaskStatus::Succeeded)
                } else {
                    deps.all(|s| s.is_terminal())
                };
                ready.then(|| task.id.clone())
            })
            .collect()
    }

    /// Pending tasks that must be skipped because a dependency did not
    /// succeed, paired with that dependency.
    ///
    /// Only tasks using the default skip policy are returned. Callers apply
    /// the skips and ask again until the list is empty, which cascades the
    /// skip through the dependents.
    pub fn skippable_tasks(&self, states: &ExecutionStates) -> Vec<(TaskId, TaskId)> {
        self.order
            .iter()
            .filter_map(|&index| {
                let task = &self.graph[index];
                if !task.skip_on_dependency_failure
                    || states.status(&task.id) != Some(TaskStatus::Pending)
                {
                    return None;
                }
                task.depends_on
                    .iter()
                    .find(|dep| states.status(dep).is_some_and(|s| s.is_unsuccessful()))
                    .map(|dep| (task.id.clone(), dep.clone()))
            })
            .collect()
    }

    /// Dependencies of a task that ended without succeeding.
    pub fn unsuccessful_dependencies(&self, id: &TaskId, states: &ExecutionStates) -> Vec<TaskId> {
        self.dependencies(id)
            .into_iter()
            .filter(|dep| states.status(&dep.id).is_some_and(|s| s.is_unsuccessful()))
            .map(|dep| dep.id.clone())
            .collect()
    }

    fn dependency_statuses<'a>(
        &'a self,
        index: NodeIndex,
        states: &'a ExecutionStates,
    ) -> impl Iterator<Item = TaskStatus> + 'a {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(move |dep| {
                states
                    .status(&self.graph[dep].id)
                    .unwrap_or(TaskStatus::Pending)
            })
    }
}

/// Kahn's algorithm with a min-heap so ties resolve to declaration order.
fn stable_order(graph: &DiGraph<TaskNode, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut heap: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(index)) = heap.pop() {
        order.push(index);
        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                heap.push(Reverse(next));
            }
        }
    }
    order
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
