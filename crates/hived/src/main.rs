//! hived: Hive node daemon.
//!
//! Usage: `hived [broker|coordinator|worker|standalone]` (default
//! `standalone`). Node identity, broker address and everything else come
//! from the config file and `HIVE_*` environment overrides.

use anyhow::{bail, Result};

use hive_core::config::HiveConfig;

mod broker;
mod coordinator;
mod node;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = HiveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = HiveConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HiveConfig::default()
    });

    let role = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "standalone".to_string());
    tracing::info!(role, node = %config.node.id, kind = %config.node.kind, "hived starting");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match role.as_str() {
        "broker" => broker::run(&config, &shutdown_tx).await,
        "coordinator" => coordinator::run(config, shutdown_tx).await,
        "worker" => worker::run(config, shutdown_tx).await,
        "standalone" => coordinator::run_standalone(config, shutdown_tx).await,
        other => bail!("unknown role {other:?}; expected broker, coordinator, worker or standalone"),
    }
}

/// Ctrl-C, or SIGTERM from the scaler stopping this worker.
async fn wait_for_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
