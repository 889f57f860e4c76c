use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive_core::config::CoordinatorSettings;
use hive_core::{HiveError, Result, TaskPayload};
use hive_services::coordinator::PhaseStatus;
use hive_services::{Operation, TaskStatus, WorkflowStatus};

use crate::*;

/// Fails the first `failures` calls, then echoes.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Operation for Flaky {
    async fn execute(&self, task: &TaskPayload) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(HiveError::TaskFailure(format!("attempt {} failed", n + 1)));
        }
        Ok(json!({ "attempt": n + 1, "params": task.params }))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Happy path
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn delivery_workflow_runs_every_phase() {
    let cluster = Cluster::new(CoordinatorSettings {
        dispatch_timeout_ms: 5_000,
        wait_for_agents_secs: 5,
        ..CoordinatorSettings::default()
    });
    for (id, kind) in [
        ("research-1", "research"),
        ("code-1", "code"),
        ("data-1", "data"),
        ("qa-1", "qa"),
    ] {
        cluster.spawn_worker(id, kind);
    }
    cluster
        .wait_online(&["research-1", "code-1", "data-1", "qa-1"])
        .await
        .unwrap();

    let report = cluster.coordinator.activate().await;
    assert!(!report.degraded);
    assert_eq!(report.agents_online, 4);
    assert_eq!(report.agents_expected, 4);

    let workflow = within(
        Duration::from_secs(10),
        cluster
            .coordinator
            .run_workflow("delivery", Some(json!({ "depth": 2 }))),
    )
    .await
    .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.error.is_none());
    assert!(workflow.completed_at.is_some());
    assert!(workflow.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    // build: 2 nodes × 2 task types
    assert_eq!(workflow.phases[1].task_ids.len(), 4);

    let view = cluster.coordinator.workflow_view(&workflow.id).unwrap();
    assert_eq!(view.tasks.len(), 6);
    for task in &view.tasks {
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.id);
        let result = task.result.as_ref().unwrap();
        assert_eq!(result["node"], task.target_node_id.as_str());
        assert_eq!(result["params"]["depth"], 2);
    }
    let code = view.tasks.iter().find(|t| t.target_node_id == "code-1").unwrap();
    assert_eq!(code.worker_type, "code");

    let status = cluster.coordinator.status();
    assert!(status.active);
    assert_eq!(status.workflows.completed, 1);
    assert_eq!(status.dead_letters, 0);
}

#[tokio::test]
async fn started_workflow_finishes_in_background() {
    let cluster = Cluster::with_templates(
        vec![template("gather", vec![phase("one", &["r1"], &["research"], false)])],
        5_000,
    );
    cluster.spawn_worker("r1", "research");
    cluster.wait_online(&["r1"]).await.unwrap();

    let mut events = cluster.coordinator.events().subscribe();
    let id = cluster.coordinator.start_workflow("gather", None).unwrap();

    let coordinator = cluster.coordinator.clone();
    let done = id.clone();
    wait_until(Duration::from_secs(5), move || {
        coordinator
            .workflow(&done)
            .is_some_and(|w| w.status == WorkflowStatus::Completed)
    })
    .await
    .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
    }
    assert!(kinds.contains(&json!("workflow-started")));
    assert!(kinds.contains(&json!("workflow-finished")));
}

#[tokio::test]
async fn kind_phase_spreads_over_scaled_instances() {
    let cluster = Cluster::with_templates(
        vec![template(
            "survey",
            vec![kind_phase("fan-out", &["research"], &["research", "survey"], true)],
        )],
        5_000,
    );
    cluster.spawn_worker("research-1", "research");
    cluster.spawn_worker("research-scaled-1", "research");
    cluster.spawn_worker("code-1", "code");
    cluster
        .wait_online(&["research-1", "research-scaled-1", "code-1"])
        .await
        .unwrap();

    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("survey", None),
    )
    .await
    .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let view = cluster.coordinator.workflow_view(&workflow.id).unwrap();
    let mut targets: Vec<&str> = view.tasks.iter().map(|t| t.target_node_id.as_str()).collect();
    targets.sort();
    assert_eq!(targets, ["research-1", "research-scaled-1"]);
    for task in &view.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap()["node"], task.target_node_id.as_str());
    }
}

#[tokio::test]
async fn scaled_instance_alone_receives_kind_work() {
    let cluster = Cluster::with_templates(
        vec![template("gather", vec![kind_phase("one", &["research"], &["research"], false)])],
        5_000,
    );
    cluster.spawn_worker("research-scaled-1", "research");
    cluster.wait_online(&["research-scaled-1"]).await.unwrap();

    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("gather", None),
    )
    .await
    .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let task = cluster
        .coordinator
        .tasks()
        .get(&workflow.phases[0].task_ids[0])
        .unwrap();
    assert_eq!(task.target_node_id, "research-scaled-1");
    assert_eq!(task.target_kind.as_deref(), Some("research"));
}

#[tokio::test]
async fn phase_priority_travels_with_the_task() {
    let mut urgent = phase("one", &["r1"], &["research"], false);
    urgent.priority = hive_core::TaskPriority::High;
    let cluster = Cluster::with_templates(vec![template("urgent", vec![urgent])], 5_000);
    cluster.spawn_worker("r1", "research");
    cluster.wait_online(&["r1"]).await.unwrap();

    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("urgent", None),
    )
    .await
    .unwrap();
    let task = cluster
        .coordinator
        .tasks()
        .get(&workflow.phases[0].task_ids[0])
        .unwrap();
    assert_eq!(task.priority, hive_core::TaskPriority::High);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn unknown_workflow_type_is_not_found() {
    let cluster = Cluster::with_templates(
        vec![template("gather", vec![phase("one", &["r1"], &["research"], false)])],
        5_000,
    );
    let err = cluster.coordinator.start_workflow("nope", None).unwrap_err();
    assert!(matches!(err, HiveError::NotFound(_)));
    let err = cluster
        .coordinator
        .start_workflow("gather", Some(json!([1, 2])))
        .unwrap_err();
    assert!(matches!(err, HiveError::Validation(_)));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Failures
// ══════════════════════════════════════════════════════════════════════════════

/// Parallel phase [a, b] where b never answers, followed by [c].
fn fan_out(continue_on_failure: bool) -> WorkflowTemplate {
    let mut first = phase("fan-out", &["a", "b"], &["research"], true);
    first.continue_on_failure = continue_on_failure;
    template("pipeline", vec![first, phase("follow-up", &["c"], &["code"], false)])
}

#[tokio::test]
async fn timed_out_parallel_task_stops_the_workflow() {
    let mut cluster = Cluster::with_templates(vec![fan_out(false)], 300);
    cluster.spawn_worker("a", "research");
    cluster.spawn_silent("b", "research");
    let c = cluster.spawn_worker("c", "code");
    cluster.wait_online(&["a", "b", "c"]).await.unwrap();

    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("pipeline", None),
    )
    .await
    .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.error.as_deref().unwrap().contains("fan-out"));
    assert_eq!(workflow.phases[0].status, PhaseStatus::Failed);
    assert_eq!(workflow.phases[1].status, PhaseStatus::Pending);
    assert!(workflow.phases[1].task_ids.is_empty());

    let tasks = cluster.coordinator.tasks().tasks_for_workflow(&workflow.id);
    assert_eq!(tasks.len(), 2);
    let a = tasks.iter().find(|t| t.target_node_id == "a").unwrap();
    let b = tasks.iter().find(|t| t.target_node_id == "b").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Timeout);
    assert!(tasks.iter().all(|t| t.target_node_id != "c"));
    assert_eq!(c.metrics().completed_tasks, 0);

    let dead = cluster.coordinator.tasks().dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, b.id);
}

#[tokio::test]
async fn continue_on_failure_runs_later_phases() {
    let mut cluster = Cluster::with_templates(vec![fan_out(true)], 300);
    cluster.spawn_worker("a", "research");
    cluster.spawn_silent("b", "research");
    let c = cluster.spawn_worker("c", "code");
    cluster.wait_online(&["a", "b", "c"]).await.unwrap();

    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("pipeline", None),
    )
    .await
    .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.phases[0].status, PhaseStatus::Failed);
    assert_eq!(workflow.phases[1].status, PhaseStatus::Completed);
    assert_eq!(c.metrics().completed_tasks, 1);
    assert_eq!(cluster.coordinator.tasks().dead_letters().len(), 1);
}

#[tokio::test]
async fn sequential_phase_stops_at_first_failure() {
    let mut cluster = Cluster::with_templates(
        vec![template("steps", vec![phase("serial", &["slow", "fast"], &["data"], false)])],
        300,
    );
    cluster.spawn_silent("slow", "data");
    let fast = cluster.spawn_worker("fast", "data");
    cluster.wait_online(&["slow", "fast"]).await.unwrap();

    let workflow = within(Duration::from_secs(5), cluster.coordinator.run_workflow("steps", None))
        .await
        .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.phases[0].task_ids.len(), 1);
    assert_eq!(fast.metrics().completed_tasks, 0);
}

#[tokio::test]
async fn declared_retries_create_new_tasks() {
    let mut retrying = phase("flaky", &["w"], &["code"], false);
    retrying.max_retries = 2;
    let cluster = Cluster::with_templates(vec![template("retry", vec![retrying])], 2_000);
    let op = Arc::new(Flaky {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    cluster.spawn_worker_with("w", "code", |b| b.operation("code", op.clone()));
    cluster.wait_online(&["w"]).await.unwrap();

    let workflow = within(Duration::from_secs(5), cluster.coordinator.run_workflow("retry", None))
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let ids = &workflow.phases[0].task_ids;
    assert_eq!(ids.len(), 2);
    let store = cluster.coordinator.tasks();
    let first = store.get(&ids[0]).unwrap();
    let second = store.get(&ids[1]).unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.superseded_by.as_deref(), Some(second.id.as_str()));
    assert_eq!(first.retry_count, 0);
    assert_eq!(second.retry_count, 1);
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(second.result.as_ref().unwrap()["attempt"], 2);
    assert!(store.dead_letters().is_empty());
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let mut retrying = phase("flaky", &["w"], &["code"], false);
    retrying.max_retries = 1;
    let cluster = Cluster::with_templates(vec![template("retry", vec![retrying])], 2_000);
    let op = Arc::new(Flaky {
        failures: 10,
        calls: AtomicUsize::new(0),
    });
    cluster.spawn_worker_with("w", "code", |b| b.operation("code", op.clone()));
    cluster.wait_online(&["w"]).await.unwrap();

    let workflow = within(Duration::from_secs(5), cluster.coordinator.run_workflow("retry", None))
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.phases[0].task_ids.len(), 2);
    assert_eq!(op.calls.load(Ordering::SeqCst), 2);

    let dead = cluster.coordinator.tasks().dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
    assert!(dead[0].error.as_deref().unwrap().contains("attempt 2 failed"));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation
// ══════════════════════════════════════════════════════════════════════════════

async fn stuck_cluster() -> (Cluster, String) {
    let mut cluster = Cluster::with_templates(
        vec![template("stuck", vec![phase("wait", &["mute"], &["research"], false)])],
        60_000,
    );
    cluster.spawn_silent("mute", "research");
    let id = cluster.coordinator.start_workflow("stuck", None).unwrap();

    let store = cluster.coordinator.tasks().clone();
    wait_until(Duration::from_secs(5), move || store.running().len() == 1)
        .await
        .unwrap();
    (cluster, id)
}

async fn wait_failed(cluster: &Cluster, id: &str) {
    let coordinator = cluster.coordinator.clone();
    let id = id.to_string();
    wait_until(Duration::from_secs(5), move || {
        coordinator
            .workflow(&id)
            .is_some_and(|w| w.status == WorkflowStatus::Failed)
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn deactivate_cancels_inflight_dispatch() {
    let (cluster, id) = stuck_cluster().await;
    cluster.coordinator.deactivate();
    assert!(!cluster.coordinator.is_active());

    wait_failed(&cluster, &id).await;
    let tasks = cluster.coordinator.tasks().tasks_for_workflow(&id);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0].error.as_deref().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn task_on_vanished_node_is_reaped() {
    let (cluster, id) = stuck_cluster().await;
    assert_eq!(cluster.coordinator.reap_orphaned_tasks(), 0);

    assert!(cluster.registry.deregister("mute"));
    assert_eq!(cluster.coordinator.reap_orphaned_tasks(), 1);

    wait_failed(&cluster, &id).await;
    let tasks = cluster.coordinator.tasks().tasks_for_workflow(&id);
    assert!(tasks[0].error.as_deref().unwrap().contains("offline"));
    assert_eq!(cluster.coordinator.tasks().dead_letters().len(), 1);
}
