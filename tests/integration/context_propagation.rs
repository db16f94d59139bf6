//! Context propagation integration tests.
//!
//! Covers what agents see as inputs, how merge policies combine writes and
//! how protocol violations and exclusive conflicts end a run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use maestro::context::MergePolicy;
use maestro::core::{Backoff, RetryPolicy, TaskNode, TaskStatus, WorkflowDefinition, WorkflowGraph};
use maestro::orchestration::{ControllerOptions, ExecutionController};
use maestro::workflow::RunStatus;

use crate::fixtures::{exclusive_clash, fan_out, id, run_collecting, ScriptedInvoker, Step};

fn options(concurrency: usize) -> ControllerOptions {
    ControllerOptions::default().concurrency(concurrency)
}

/// Test: a task's outputs appear all at once, and only after it finished.
#[tokio::test(start_paused = true)]
async fn test_outputs_are_never_partially_visible() {
    let definition = WorkflowDefinition::new("atomic")
        .task(TaskNode::new("writer", "x").writes("k1").writes("k2"))
        .task(TaskNode::new("bystander", "x").reads("k1").reads("k2"))
        .task(
            TaskNode::new("reader", "x")
                .depends_on("writer")
                .reads("k1")
                .reads("k2"),
        );
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on(
                "writer",
                Step::ok(&[("k1", json!(1)), ("k2", json!(2))]).after(Duration::from_millis(50)),
            )
            .on("bystander", Step::ok(&[]).after(Duration::from_millis(10))),
    );

    let (result, _) = run_collecting(invoker.clone(), definition, options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert!(invoker.calls_for("bystander")[0].inputs.is_empty());
    let reader = &invoker.calls_for("reader")[0];
    assert_eq!(reader.inputs.get("k1"), Some(&json!(1)));
    assert_eq!(reader.inputs.get("k2"), Some(&json!(2)));
}

/// Test: agents only receive the keys their input selector names.
#[tokio::test]
async fn test_inputs_limited_to_selector() {
    let invoker = Arc::new(ScriptedInvoker::new().on("a", Step::ok(&[("plan", json!("p"))])));

    let (_, _) = run_collecting(invoker.clone(), fan_out(), options(2)).await;

    let b = &invoker.calls_for("b")[0];
    assert_eq!(b.inputs.len(), 1);
    assert!(b.inputs.contains_key("plan"));
    assert!(!b.inputs.contains_key("topic"));
}

/// Test: seeded values are in the final context without a writer.
#[tokio::test]
async fn test_seeded_context_in_snapshot() {
    let invoker = Arc::new(ScriptedInvoker::new().on("a", Step::ok(&[("plan", json!("p"))])));

    let (result, _) = run_collecting(invoker, fan_out(), options(2)).await;

    let topic = &result.context["topic"];
    assert_eq!(topic.value, json!("rust"));
    assert_eq!(topic.writer, None);
    assert_eq!(topic.version, 1);
    assert_eq!(result.context["plan"].writer, Some(id("a")));
}

/// Test: two concurrent exclusive writers abort the run.
#[tokio::test(start_paused = true)]
async fn test_exclusive_clash_fails_run() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on(
                "left",
                Step::ok(&[("report", json!("l"))]).after(Duration::from_millis(10)),
            )
            .on(
                "right",
                Step::ok(&[("report", json!("r"))]).after(Duration::from_millis(20)),
            ),
    );

    let (result, _) = run_collecting(invoker.clone(), exclusive_clash("report"), options(2)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("exclusive"));
    assert_eq!(result.task(&id("left")).unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.task(&id("right")).unwrap().status, TaskStatus::Failed);
    assert_eq!(result.task(&id("after")).unwrap().status, TaskStatus::Cancelled);
    assert!(invoker.calls_for("after").is_empty());

    let report = &result.context["report"];
    assert_eq!(report.value, json!("l"));
    assert_eq!(report.version, 1);
}

/// Test: sequential last-write-wins writes bump the version.
#[tokio::test]
async fn test_last_write_wins_within_run() {
    let definition = WorkflowDefinition::new("scores")
        .task(TaskNode::new("first", "x").writes_with("score", MergePolicy::LastWriteWins))
        .task(
            TaskNode::new("second", "x")
                .depends_on("first")
                .reads("score")
                .writes_with("score", MergePolicy::LastWriteWins),
        );
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("first", Step::ok(&[("score", json!(0.7))]))
            .on("second", Step::ok(&[("score", json!(0.9))])),
    );

    let (result, _) = run_collecting(invoker.clone(), definition, options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(
        invoker.calls_for("second")[0].inputs.get("score"),
        Some(&json!(0.7))
    );
    let score = &result.context["score"];
    assert_eq!(score.value, json!(0.9));
    assert_eq!(score.version, 2);
    assert_eq!(score.writer, Some(id("second")));
}

/// Test: every run starts from a fresh context.
#[tokio::test]
async fn test_runs_do_not_share_context() {
    let definition = WorkflowDefinition::new("scores")
        .task(TaskNode::new("only", "x").writes_with("score", MergePolicy::LastWriteWins));
    let graph = Arc::new(WorkflowGraph::build(definition).unwrap());
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("only", Step::ok(&[("score", json!(0.7))]))
            .on("only", Step::ok(&[("score", json!(0.9))])),
    );
    let controller = ExecutionController::new(invoker.clone());

    let first = controller.run_graph(Arc::clone(&graph)).await;
    let second = controller.run_graph(graph).await;

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.context["score"].value, json!(0.7));
    assert_eq!(second.context["score"].value, json!(0.9));
    assert_eq!(second.context["score"].version, 1);
}

/// Test: concurrent append writers keep every value.
#[tokio::test]
async fn test_append_from_concurrent_tasks() {
    let definition = WorkflowDefinition::new("log")
        .task(TaskNode::new("p", "x").writes_with("log", MergePolicy::Append))
        .task(TaskNode::new("q", "x").writes_with("log", MergePolicy::Append));
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("p", Step::ok(&[("log", json!("from p"))]))
            .on("q", Step::ok(&[("log", json!("from q"))])),
    );

    let (result, _) = run_collecting(invoker.clone(), definition, options(2)).await;

    assert_eq!(result.status, RunStatus::Completed);
    let log = &result.context["log"];
    assert_eq!(log.version, 2);
    let items = log.value.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.contains(&json!("from p")));
    assert!(items.contains(&json!("from q")));
}

/// Test: returning an undeclared key fails the task without retrying.
#[tokio::test]
async fn test_protocol_violation_not_retried() {
    let definition = WorkflowDefinition::new("strict")
        .task(
            TaskNode::new("a", "x")
                .writes("plan")
                .with_retry(RetryPolicy::new(3, Backoff::None)),
        )
        .task(TaskNode::new("b", "x").depends_on("a").reads("plan"));
    let invoker = Arc::new(ScriptedInvoker::new().on(
        "a",
        Step::ok(&[("plan", json!("p")), ("secret", json!("s"))]),
    ));

    let (result, _) = run_collecting(invoker.clone(), definition, options(2)).await;

    assert_eq!(result.status, RunStatus::Failed);
    let a = result.task(&id("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(a.last_error.as_deref().unwrap().contains("secret"));
    assert_eq!(invoker.total_calls(), 1);
    assert_eq!(result.task(&id("b")).unwrap().status, TaskStatus::Skipped);
    assert!(!result.context.contains_key("plan"));
}

/// Test: a task that opted out of skipping runs with its failed dependency
/// reported as degraded.
#[tokio::test]
async fn test_degraded_dependency_run() {
    let definition = WorkflowDefinition::new("degraded")
        .task(TaskNode::new("a", "x").writes("plan"))
        .task(
            TaskNode::new("b", "x")
                .depends_on("a")
                .reads("plan")
                .writes("fallback")
                .run_on_dependency_failure(),
        );
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .on("a", Step::rejected())
            .on("b", Step::ok(&[("fallback", json!(true))])),
    );

    let (result, _) = run_collecting(invoker.clone(), definition, options(2)).await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    let b = &invoker.calls_for("b")[0];
    assert_eq!(b.degraded, vec![id("a")]);
    assert!(b.inputs.is_empty());
    assert_eq!(result.task(&id("b")).unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.context["fallback"].value, json!(true));
}
