//! Broker role: accepts node connections and routes frames between them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use hive_core::config::HiveConfig;
use hive_services::{BrokerServer, Router};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config: &HiveConfig, shutdown_tx: &broadcast::Sender<()>) -> Result<()> {
    let router = Arc::new(Router::new());
    let server = BrokerServer::bind(&config.broker.listen, router.clone(), shutdown_tx.subscribe())
        .await
        .with_context(|| format!("failed to bind broker on {}", config.broker.listen))?;
    tracing::info!(addr = %server.local_addr()?, "broker ready");

    let snapshot = {
        let router = router.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let nodes = router.connected();
                        tracing::info!(count = nodes.len(), ?nodes, "broker connections snapshot");
                    }
                }
            }
        })
    };

    server.run().await?;
    snapshot.abort();
    Ok(())
}
