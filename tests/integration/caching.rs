use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive_core::{Result, TaskPayload};
use hive_services::{Operation, Task, TaskStatus, WorkflowStatus};

use crate::*;

struct Counting(AtomicUsize);

#[async_trait]
impl Operation for Counting {
    async fn execute(&self, task: &TaskPayload) -> Result<Value> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "run": n, "topic": task.params["topic"] }))
    }
}

fn research_cluster() -> (Cluster, Arc<Counting>) {
    let cluster = Cluster::with_templates(
        vec![template("gather", vec![phase("one", &["r1"], &["research"], false)])],
        5_000,
    );
    let op = Arc::new(Counting(AtomicUsize::new(0)));
    cluster.spawn_worker_with("r1", "research", |b| b.operation("research", op.clone()));
    (cluster, op)
}

async fn run(cluster: &Cluster, params: Value) -> Value {
    let workflow = within(
        Duration::from_secs(5),
        cluster.coordinator.run_workflow("gather", Some(params)),
    )
    .await
    .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let task_id = &workflow.phases[0].task_ids[0];
    cluster.coordinator.tasks().get(task_id).unwrap().result.unwrap()
}

#[tokio::test]
async fn repeated_task_is_served_from_cache() {
    let (cluster, op) = research_cluster();
    cluster.wait_online(&["r1"]).await.unwrap();

    let first = run(&cluster, json!({ "topic": "raft", "depth": 1 })).await;
    // Same params in a different key order hit the same entry.
    let second = run(&cluster, json!({ "depth": 1, "topic": "raft" })).await;

    assert_eq!(op.0.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(first["run"], 1);

    let stats = cluster.cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.entries, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn different_params_miss() {
    let (cluster, op) = research_cluster();
    cluster.wait_online(&["r1"]).await.unwrap();

    run(&cluster, json!({ "topic": "raft" })).await;
    run(&cluster, json!({ "topic": "paxos" })).await;
    assert_eq!(op.0.load(Ordering::SeqCst), 2);
    assert_eq!(cluster.cache.stats().entries, 2);
}

#[tokio::test]
async fn invalidated_entries_run_again() {
    let (cluster, op) = research_cluster();
    cluster.wait_online(&["r1"]).await.unwrap();

    run(&cluster, json!({ "topic": "raft" })).await;
    assert_eq!(cluster.cache.invalidate("code:*").unwrap(), 0);
    assert_eq!(cluster.cache.invalidate("research:*").unwrap(), 1);

    let again = run(&cluster, json!({ "topic": "raft" })).await;
    assert_eq!(again["run"], 2);
    assert_eq!(op.0.load(Ordering::SeqCst), 2);

    let info = cluster.cache.info();
    assert_eq!(info.entries, 1);
    assert_eq!(info.by_task_type["research"].entries, 1);
}

#[tokio::test]
async fn workers_with_separate_caches_share_the_owners_entries() {
    let mut cluster = Cluster::with_templates(Vec::new(), 5_000);
    cluster.serve_cache();
    let ops: Vec<Arc<Counting>> = (0..2).map(|_| Arc::new(Counting(AtomicUsize::new(0)))).collect();
    for (id, op) in ["r1", "r2"].into_iter().zip(&ops) {
        let op = op.clone();
        cluster.spawn_worker_with(id, "research", move |b| {
            b.operation("research", op)
                .shared_cache(COORDINATOR, Duration::from_secs(2))
        });
    }
    cluster.wait_online(&["r1", "r2"]).await.unwrap();

    let mut results = Vec::new();
    for node in ["r1", "r2"] {
        let mut task = Task::for_kind("research", "research", json!({ "topic": "raft" }));
        task.target_node_id = node.to_string();
        cluster.coordinator.tasks().insert(task.clone());
        within(Duration::from_secs(5), cluster.coordinator.dispatch(&task))
            .await
            .unwrap();
        let done = cluster.coordinator.tasks().get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        results.push(done.result.unwrap());
    }

    assert_eq!(ops[0].0.load(Ordering::SeqCst), 1);
    assert_eq!(ops[1].0.load(Ordering::SeqCst), 0);
    assert_eq!(results[0], results[1]);
    let stats = cluster.cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));

    // Invalidating on the owner is seen by every worker.
    assert_eq!(cluster.cache.invalidate("research:*").unwrap(), 1);
    let mut task = Task::for_kind("research", "research", json!({ "topic": "raft" }));
    task.target_node_id = "r2".to_string();
    cluster.coordinator.tasks().insert(task.clone());
    within(Duration::from_secs(5), cluster.coordinator.dispatch(&task))
        .await
        .unwrap();
    assert_eq!(ops[1].0.load(Ordering::SeqCst), 1);
}
