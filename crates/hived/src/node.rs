//! Pieces every node role shares: broker connection, heartbeats, workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hive_core::config::HiveConfig;
use hive_core::NodeAnnouncement;
use hive_services::bus::{Inbox, Membership};
use hive_services::metrics::HostMetrics;
use hive_services::registry::heartbeat_loop;
use hive_services::worker::{CommandOperation, EchoOperation};
use hive_services::{MessageBus, RemoteCache, ResultCache, RetryPolicy, TcpTransport, Worker};

pub fn announcement(id: &str, kind: &str, capabilities: &[String]) -> NodeAnnouncement {
    NodeAnnouncement {
        id: id.to_string(),
        kind: kind.to_string(),
        capabilities: capabilities.iter().cloned().collect(),
    }
}

/// Connect to the configured broker over TCP and start a bus on it.
pub async fn connect(config: &HiveConfig, membership: Arc<dyn Membership>) -> Result<(MessageBus, Inbox)> {
    let reconnect = RetryPolicy::from(config.resilience.reconnect);
    let (transport, inbound) = TcpTransport::connect(&config.broker.url, config.node.id.clone(), reconnect)
        .await
        .with_context(|| format!("failed to connect to broker at {}", config.broker.url))?;
    tracing::info!(node = %config.node.id, broker = %config.broker.url, "connected to broker");
    Ok(MessageBus::start(
        config.node.id.clone(),
        Arc::new(transport),
        inbound,
        config.bus.clone(),
        membership,
    ))
}

/// Heartbeats carrying host utilisation plus the worker's task counters.
pub fn spawn_heartbeat(
    bus: MessageBus,
    node: NodeAnnouncement,
    interval: Duration,
    worker: Option<Worker>,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let host = HostMetrics::new();
    tokio::spawn(heartbeat_loop(
        bus,
        node,
        interval,
        move || {
            let mut metrics = worker.as_ref().map(Worker::metrics).unwrap_or_default();
            metrics.cpu_percent = host.cpu_percent();
            metrics.memory_percent = host.memory_percent();
            metrics.pid = Some(std::process::id());
            metrics
        },
        shutdown,
    ))
}

/// The cache held by `config.cache.owner`, reached over `bus`.
pub fn owner_cache(bus: &MessageBus, config: &HiveConfig) -> ResultCache {
    ResultCache::Remote(RemoteCache::new(
        bus.clone(),
        config.cache.owner.clone(),
        config.cache.remote_timeout(),
    ))
}

/// Worker with the built-in operations: `command` runs a subprocess, every
/// other task type is echoed back.
pub fn build_worker(bus: MessageBus, config: &HiveConfig, cache: ResultCache) -> Worker {
    let node_id = bus.node_id().to_string();
    let work_dir = std::env::temp_dir().join("hive").join(&node_id);
    Worker::builder(bus, config.resilience.breaker)
        .operation("command", Arc::new(CommandOperation::new(work_dir)))
        .fallback(Arc::new(EchoOperation::new(node_id)))
        .result_cache(cache)
        .build()
}
