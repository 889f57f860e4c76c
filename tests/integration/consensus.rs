use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use hive_core::config::CoordinatorSettings;
use hive_core::Vote;
use hive_services::worker::Voter;

use crate::*;

struct Reject;

impl Voter for Reject {
    fn vote(&self, _proposer: &str, _payload: &Value) -> Vote {
        Vote::No
    }
}

/// Votes yes only on proposals carrying `"safe": true`.
struct SafeOnly;

impl Voter for SafeOnly {
    fn vote(&self, _proposer: &str, payload: &Value) -> Vote {
        if payload["safe"] == true {
            Vote::Yes
        } else {
            Vote::No
        }
    }
}

fn cluster() -> Cluster {
    Cluster::new(CoordinatorSettings::default())
}

#[tokio::test]
async fn unanimous_yes_is_accepted_at_quorum() {
    let cluster = cluster();
    for id in ["v1", "v2", "v3"] {
        cluster.spawn_worker(id, "qa");
    }
    cluster.wait_online(&["v1", "v2", "v3"]).await.unwrap();

    let outcome = within(
        Duration::from_secs(5),
        cluster.bus.propose(json!({ "action": "rollout" })),
    )
    .await
    .unwrap();
    assert!(outcome.accepted);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.quorum, 2);
    assert!(outcome.yes >= 2);
    assert_eq!(outcome.no, 0);
}

#[tokio::test]
async fn unanimous_no_is_rejected() {
    let cluster = cluster();
    for id in ["v1", "v2", "v3"] {
        cluster.spawn_worker_with(id, "qa", |b| b.voter(Arc::new(Reject)));
    }
    cluster.wait_online(&["v1", "v2", "v3"]).await.unwrap();

    let outcome = cluster.bus.propose(json!({ "action": "rollout" })).await.unwrap();
    assert!(!outcome.accepted);
    assert!(outcome.no >= 2);
}

#[tokio::test]
async fn voters_see_the_payload() {
    let cluster = cluster();
    for id in ["v1", "v2"] {
        cluster.spawn_worker_with(id, "qa", |b| b.voter(Arc::new(SafeOnly)));
    }
    cluster.wait_online(&["v1", "v2"]).await.unwrap();

    let safe = cluster.bus.propose(json!({ "safe": true })).await.unwrap();
    assert!(safe.accepted);
    assert_eq!(safe.yes, 2);

    let unsafe_ = cluster.bus.propose(json!({ "safe": false })).await.unwrap();
    assert!(!unsafe_.accepted);
    assert_eq!(unsafe_.no, 2);
}

#[tokio::test]
async fn silent_majority_times_out_without_quorum() {
    let mut cluster = cluster();
    cluster.spawn_worker("v1", "qa");
    cluster.spawn_silent("m1", "qa");
    cluster.spawn_silent("m2", "qa");
    cluster.wait_online(&["v1", "m1", "m2"]).await.unwrap();

    let outcome = cluster
        .bus
        .propose_with_timeout(json!({ "action": "rollout" }), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(outcome.timed_out);
    assert!(!outcome.accepted);
    assert_eq!(outcome.quorum, 2);
    assert_eq!(outcome.yes, 1);
}

#[tokio::test]
async fn no_eligible_voters_rejects() {
    let cluster = cluster();
    let outcome = cluster
        .bus
        .propose_with_timeout(json!({ "action": "rollout" }), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(!outcome.accepted);
    assert_eq!(outcome.yes + outcome.no, 0);
}
