//! End-to-end workflow integration tests.
//!
//! These tests run whole definitions through the controller with a
//! scripted invoker and check dependency ordering, concurrency and the
//! final run status.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use maestro::core::{GraphError, TaskNode, TaskStatus, WorkflowDefinition};
use maestro::orchestration::{ControllerOptions, ExecutionController, SchedulerEvent};
use maestro::workflow::{RunResult, RunStatus};
use maestro::Error;

use crate::fixtures::{fan_out, id, position, run_collecting, ScriptedInvoker, Step};

fn options(concurrency: usize) -> ControllerOptions {
    ControllerOptions::default().concurrency(concurrency)
}

/// Test: A runs alone, then B and C run concurrently.
#[tokio::test(start_paused = true)]
async fn test_fan_out_runs_dependents_concurrently() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on(
                "a",
                Step::ok(&[("plan", json!("outline"))]).after(Duration::from_millis(10)),
            )
            .on(
                "b",
                Step::ok(&[("draft", json!("text"))]).after(Duration::from_millis(50)),
            )
            .on(
                "c",
                Step::ok(&[("notes", json!("fine"))]).after(Duration::from_millis(50)),
            ),
    );

    let (result, _) = run_collecting(invoker.clone(), fan_out(), options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.count(TaskStatus::Succeeded), 3);

    let a = &invoker.calls_for("a")[0];
    let b = &invoker.calls_for("b")[0];
    let c = &invoker.calls_for("c")[0];
    let a_done = a.finished.unwrap();
    assert!(b.started >= a_done, "b started before a finished");
    assert!(c.started >= a_done, "c started before a finished");
    assert!(b.started < c.finished.unwrap() && c.started < b.finished.unwrap());
    assert_eq!(invoker.peak_concurrency(), 2);

    assert_eq!(a.inputs.get("topic"), Some(&json!("rust")));
    assert_eq!(b.inputs.get("plan"), Some(&json!("outline")));
}

/// Test: A fails, B and C are skipped and the run fails.
#[tokio::test]
async fn test_fan_out_root_failure_skips_dependents() {
    let invoker = Arc::new(ScriptedInvoker::new().on("a", Step::rejected()));

    let (result, events) = run_collecting(invoker.clone(), fan_out(), options(2)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.task(&id("a")).unwrap().status, TaskStatus::Failed);
    assert_eq!(result.task(&id("b")).unwrap().status, TaskStatus::Skipped);
    assert_eq!(result.task(&id("c")).unwrap().status, TaskStatus::Skipped);
    assert_eq!(invoker.total_calls(), 1);

    let failed = position(&events, |e| matches!(e, SchedulerEvent::TaskFailed { .. }));
    let skipped = position(&events, |e| matches!(e, SchedulerEvent::TaskSkipped { .. }));
    assert!(failed < skipped);
}

/// Test: one branch failing leaves the run partially failed.
#[tokio::test]
async fn test_branch_failure_is_partial() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("a", Step::ok(&[("plan", json!("outline"))]))
            .on("b", Step::rejected()),
    );

    let (result, _) = run_collecting(invoker, fan_out(), options(2)).await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    assert_eq!(result.task(&id("c")).unwrap().status, TaskStatus::Succeeded);
    assert!(result
        .task(&id("b"))
        .unwrap()
        .last_error
        .as_deref()
        .unwrap()
        .contains("agent refused"));
}

/// Test: no task starts before every dependency finished.
#[tokio::test(start_paused = true)]
async fn test_dependencies_finish_before_dependents_start() {
    let definition = WorkflowDefinition::new("diamond")
        .task(TaskNode::new("root", "x"))
        .task(TaskNode::new("left", "x").depends_on("root"))
        .task(TaskNode::new("right", "x").depends_on("root"))
        .task(TaskNode::new("join", "x").depends_on("left").depends_on("right"))
        .task(TaskNode::new("free", "x"));
    let invoker = Arc::new(ScriptedInvoker::new().with_default_delay(Duration::from_millis(20)));

    let (result, _) = run_collecting(invoker.clone(), definition.clone(), options(4)).await;
    assert_eq!(result.status, RunStatus::Completed);

    for task in &definition.tasks {
        let started = invoker.calls_for(task.id.as_str())[0].started;
        for dep in &task.depends_on {
            let dep_done = invoker.calls_for(dep.as_str())[0].finished.unwrap();
            assert!(dep_done <= started, "{} started before {} finished", task.id, dep);
        }
    }
}

/// Test: when several tasks are ready, the earliest declared one goes first.
#[tokio::test]
async fn test_dispatch_follows_declaration_order() {
    let definition = WorkflowDefinition::new("order")
        .task(TaskNode::new("third", "x").depends_on("first"))
        .task(TaskNode::new("first", "x"))
        .task(TaskNode::new("second", "x"));
    let invoker = Arc::new(ScriptedInvoker::new());

    let (_, events) = run_collecting(invoker, definition, options(1)).await;

    let started: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskStarted { task_id, .. } => Some(task_id.to_string()),
            _ => None,
        })
        .collect();
    // "third" is declared first, so it wins the slot once "first" finishes.
    assert_eq!(started, vec!["first", "third", "second"]);
}

/// Test: an invalid definition fails before any invocation.
#[tokio::test]
async fn test_cyclic_definition_invokes_nothing() {
    let definition = WorkflowDefinition::new("loop")
        .task(TaskNode::new("a", "x").depends_on("c"))
        .task(TaskNode::new("b", "x").depends_on("a"))
        .task(TaskNode::new("c", "x").depends_on("b"));
    let invoker = Arc::new(ScriptedInvoker::new());
    let controller = ExecutionController::new(invoker.clone());

    let err = controller.run(definition, 2).await.unwrap_err();
    assert!(matches!(err, Error::Graph(GraphError::Cycle(_))));
    assert_eq!(invoker.total_calls(), 0);
}

#[tokio::test]
async fn test_unknown_dependency_invokes_nothing() {
    let definition =
        WorkflowDefinition::new("bad").task(TaskNode::new("a", "x").depends_on("ghost"));
    let invoker = Arc::new(ScriptedInvoker::new());
    let controller = ExecutionController::new(invoker.clone());

    let err = controller.run(definition, 2).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert_eq!(invoker.total_calls(), 0);
}

/// Test: ordered tasks writing one undeclared key are refused up front.
#[tokio::test]
async fn test_ordered_rewrite_of_undeclared_key_invokes_nothing() {
    let definition = WorkflowDefinition::new("rewrite")
        .task(TaskNode::new("a", "x").writes("draft"))
        .task(TaskNode::new("b", "x").depends_on("a").writes("draft"));
    let invoker = Arc::new(ScriptedInvoker::new());
    let controller = ExecutionController::new(invoker.clone());

    let err = controller.run(definition, 2).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Graph(GraphError::ExclusiveRewrite { ref key, .. }) if key == "draft"
    ));
    assert_eq!(invoker.total_calls(), 0);
}

#[tokio::test]
async fn test_empty_workflow_completes() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (result, events) =
        run_collecting(invoker, WorkflowDefinition::new("empty"), options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.tasks.is_empty());
    assert_eq!(
        events,
        vec![SchedulerEvent::RunFinished {
            status: RunStatus::Completed
        }]
    );
}

/// Test: a TOML definition on disk runs and its report round-trips.
#[tokio::test]
async fn test_toml_definition_and_report() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("review.toml");
    std::fs::write(
        &path,
        r#"
name = "review"

[context]
topic = "rust"

[[tasks]]
id = "draft"
agent = "writer"
inputs = ["topic"]
outputs = ["draft"]

[[tasks]]
id = "score"
agent = "critic"
depends_on = ["draft"]
inputs = ["draft"]
outputs = [{ key = "score", merge = "last-write-wins" }]
retry = { max_attempts = 2, backoff = { strategy = "fixed", delay_ms = 1 } }
"#,
    )
    .unwrap();

    let definition = WorkflowDefinition::load(&path).unwrap();
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("draft", Step::ok(&[("draft", json!("text"))]))
            .on("score", Step::transient())
            .on("score", Step::ok(&[("score", json!(0.8))])),
    );
    let (result, _) = run_collecting(invoker, definition, options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.task(&id("score")).unwrap().attempts, 2);

    let report = result.report_path(dir.path());
    result.write_report(&report).unwrap();
    let loaded: RunResult =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(loaded.workflow, "review");
    assert_eq!(loaded.context["score"].value, json!(0.8));
    assert_eq!(loaded.context["topic"].writer, None);
}

#[tokio::test]
async fn test_json_definition_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flow.json");
    std::fs::write(
        &path,
        r#"{
            "name": "json-flow",
            "tasks": [
                {"id": "one", "agent": "x", "outputs": ["n"]},
                {"id": "two", "agent": "x", "depends_on": ["one"], "inputs": ["n"]}
            ]
        }"#,
    )
    .unwrap();

    let definition = WorkflowDefinition::load(&path).unwrap();
    let invoker = Arc::new(ScriptedInvoker::new().on("one", Step::ok(&[("n", json!(1))])));
    let (result, _) = run_collecting(invoker.clone(), definition, options(1)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(invoker.calls_for("two")[0].inputs.get("n"), Some(&json!(1)));
}
