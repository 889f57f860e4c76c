use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use hive_core::config::CoordinatorSettings;
use hive_core::{HiveError, NodeAnnouncement, NodeMetrics};
use hive_services::registry::heartbeat_loop;
use hive_services::{Incoming, NodeStatus, StaticMembership};

use crate::*;

#[tokio::test]
async fn heartbeats_and_goodbye_drive_the_registry() {
    let cluster = Cluster::new(CoordinatorSettings::default());
    let (bus, _inbox) = cluster.node_bus("n1", Arc::new(StaticMembership(0)));

    let (stop, _) = broadcast::channel(1);
    let node = NodeAnnouncement {
        id: "n1".into(),
        kind: "data".into(),
        capabilities: ["etl".to_string()].into_iter().collect(),
    };
    let beat = tokio::spawn(heartbeat_loop(
        bus,
        node,
        Duration::from_millis(50),
        || NodeMetrics {
            active_tasks: 3,
            ..NodeMetrics::default()
        },
        stop.subscribe(),
    ));

    cluster.wait_online(&["n1"]).await.unwrap();
    let seen = cluster.registry.get("n1").unwrap();
    assert_eq!(seen.kind, "data");
    assert_eq!(seen.status, NodeStatus::Online);
    assert!(seen.can_run("etl"));
    assert!(seen.can_run("data"));
    assert_eq!(seen.metrics.active_tasks, 3);

    stop.send(()).unwrap();
    beat.await.unwrap();
    let registry = cluster.registry.clone();
    wait_until(Duration::from_secs(2), move || registry.get("n1").is_none())
        .await
        .unwrap();
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let cluster = Cluster::new(CoordinatorSettings::default());
    let (_a, mut a_in) = cluster.node_bus("a", Arc::new(StaticMembership(0)));
    let (_b, mut b_in) = cluster.node_bus("b", Arc::new(StaticMembership(0)));

    cluster.bus.broadcast(json!({ "notice": "drain" })).await.unwrap();

    for inbox in [&mut a_in, &mut b_in] {
        match within(Duration::from_secs(1), inbox.recv()).await {
            Some(Incoming::Broadcast { from, payload }) => {
                assert_eq!(from, COORDINATOR);
                assert_eq!(payload["notice"], "drain");
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn topic_subscribers_only() {
    let cluster = Cluster::new(CoordinatorSettings::default());
    let (a, _a_in) = cluster.node_bus("a", Arc::new(StaticMembership(0)));
    let (b, _b_in) = cluster.node_bus("b", Arc::new(StaticMembership(0)));

    let mut sub = a.subscribe("builds").await.unwrap();
    let mut other = b.subscribe("deploys").await.unwrap();
    cluster.bus.publish("builds", json!({ "id": 7 })).await.unwrap();

    let published = within(Duration::from_secs(1), sub.recv()).await.unwrap();
    assert_eq!(published.topic, "builds");
    assert_eq!(published.from, COORDINATOR);
    assert_eq!(published.payload["id"], 7);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), other.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn request_to_absent_node_times_out() {
    let cluster = Cluster::new(CoordinatorSettings::default());
    let err = cluster
        .bus
        .request_with_timeout("nobody", json!({ "ping": true }), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Timeout { .. }));
    assert_eq!(cluster.bus.pending_requests(), 0);
}
