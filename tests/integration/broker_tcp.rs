use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hive_core::config::BreakerSettings;
use hive_core::{ExecuteTask, TaskOutcome, TaskPayload, TaskPriority};
use hive_services::bus::Inbox;
use hive_services::worker::EchoOperation;
use hive_services::{BrokerServer, MessageBus, RetryPolicy, Router, StaticMembership, TcpTransport, Worker};

use crate::*;

/// Retry forever with a short, flat backoff.
fn reconnect_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 0,
        initial_backoff: Duration::from_millis(20),
        factor: 1.0,
        max_backoff: Duration::from_millis(20),
    }
}

async fn start_broker(addr: &str) -> (SocketAddr, broadcast::Sender<()>, JoinHandle<()>) {
    let (stop, rx) = broadcast::channel(1);
    let server = BrokerServer::bind(addr, Arc::new(Router::new()), rx)
        .await
        .unwrap();
    let bound = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (bound, stop, handle)
}

async fn tcp_node(addr: SocketAddr, id: &str) -> (MessageBus, Inbox) {
    let url = format!("tcp://{addr}");
    let (transport, inbound) = TcpTransport::connect(&url, id, reconnect_policy())
        .await
        .unwrap();
    MessageBus::start(
        id,
        Arc::new(transport),
        inbound,
        bus_settings(),
        Arc::new(StaticMembership(0)),
    )
}

#[tokio::test]
async fn task_round_trip_over_tcp() {
    let (addr, _stop, _server) = start_broker("127.0.0.1:0").await;
    let (coordinator, _c_in) = tcp_node(addr, "coordinator").await;
    let (worker_bus, worker_in) = tcp_node(addr, "w1").await;

    let (stop_worker, rx) = broadcast::channel(1);
    let worker = Worker::builder(worker_bus, BreakerSettings::default())
        .fallback(Arc::new(EchoOperation::new("w1")))
        .build();
    tokio::spawn(worker.clone().run(worker_in, rx));

    let task = TaskPayload {
        id: "t-1".into(),
        task_type: "research".into(),
        params: json!({ "q": "tcp" }),
        agent_id: None,
        priority: TaskPriority::High,
        cacheable: false,
    };
    let reply = within(
        Duration::from_secs(5),
        coordinator.request("w1", serde_json::to_value(ExecuteTask::new(task)).unwrap()),
    )
    .await
    .unwrap();
    let outcome: TaskOutcome = serde_json::from_value(reply).unwrap();
    assert!(outcome.success);
    let result = outcome.result.unwrap();
    assert_eq!(result["node"], "w1");
    assert_eq!(result["params"]["q"], "tcp");
    assert_eq!(worker.metrics().completed_tasks, 1);

    let _ = stop_worker.send(());
}

#[tokio::test]
async fn subscriptions_survive_a_broker_restart() {
    let (addr, stop, server) = start_broker("127.0.0.1:0").await;
    let (listener, _l_in) = tcp_node(addr, "listener").await;
    let (speaker, _s_in) = tcp_node(addr, "speaker").await;

    let mut sub = listener.subscribe("alerts").await.unwrap();
    // The subscribe frame travels ahead of the publish on another socket;
    // publish until the first one lands.
    let first = within(Duration::from_secs(5), async {
        loop {
            let _ = speaker.publish("alerts", json!({ "n": 1 })).await;
            if let Ok(Some(p)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
                return p;
            }
        }
    })
    .await;
    assert_eq!(first.payload["n"], 1);
    assert_eq!(first.from, "speaker");

    stop.send(()).unwrap();
    server.await.unwrap();

    // Same port, fresh router: nothing survives on the broker side.
    let (again, _stop2, _server2) = start_broker(&addr.to_string()).await;
    assert_eq!(again, addr);

    let replayed = within(Duration::from_secs(10), async {
        loop {
            let _ = speaker.publish("alerts", json!({ "n": 2 })).await;
            match tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
                Ok(Some(p)) if p.payload["n"] == 2 => return p,
                _ => {}
            }
        }
    })
    .await;
    assert_eq!(replayed.topic, "alerts");
}
