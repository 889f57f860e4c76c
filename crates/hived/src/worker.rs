//! Worker role: one node executing tasks for the coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use hive_core::config::HiveConfig;
use hive_services::StaticMembership;

use crate::node;

pub async fn run(config: HiveConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    if config.node.kind == "coordinator" {
        bail!("worker role needs a worker kind; set HIVE_NODE__ID and HIVE_NODE__KIND");
    }

    // Workers never propose, so they need no live voter count.
    let (bus, inbox) = node::connect(&config, Arc::new(StaticMembership(0))).await?;
    // Results are memoized in the cache owner's store, shared by every worker.
    let cache = node::owner_cache(&bus, &config);
    tracing::info!(owner = %config.cache.owner, "using shared result cache");
    let worker = node::build_worker(bus.clone(), &config, cache);
    let heartbeat = node::spawn_heartbeat(
        bus,
        node::announcement(&config.node.id, &config.node.kind, &config.node.capabilities),
        config.registry.heartbeat_interval(),
        Some(worker.clone()),
        shutdown_tx.subscribe(),
    );

    worker.run(inbox, shutdown_tx.subscribe()).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), heartbeat).await;
    Ok(())
}
