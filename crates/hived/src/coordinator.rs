//! Coordinator role: registry, workflows, cache, scaler and the HTTP API.
//!
//! The coordinator holds the hive's result cache and answers cache calls from
//! worker processes over the bus. `standalone` runs the same coordinator over
//! an in-process broker, with one worker per configured minimum instance
//! sharing the cache directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hive_core::config::HiveConfig;
use hive_services::bus::Inbox;
use hive_services::registry::presence_loop;
use hive_services::{
    CommandSpawner, Coordinator, DistributedCache, EventHub, HiveMetrics, LocalBroker, MessageBus,
    NodeRegistry, ResultCache, RetryPolicy, Scaler, StaticMembership, TaskStore, Worker,
};

use crate::node;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config: HiveConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let registry = NodeRegistry::new(&config.registry);
    let (bus, inbox) = node::connect(&config, Arc::new(registry.clone())).await?;
    let cache = DistributedCache::in_memory(config.cache.clone());
    serve(config, bus, inbox, registry, cache, true, shutdown_tx).await
}

pub async fn run_standalone(config: HiveConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let broker = LocalBroker::new();
    let registry = NodeRegistry::new(&config.registry);
    let cache = DistributedCache::in_memory(config.cache.clone());

    let (transport, inbound) = broker.connect(config.node.id.clone());
    let (bus, inbox) = MessageBus::start(
        config.node.id.clone(),
        Arc::new(transport),
        inbound,
        config.bus.clone(),
        Arc::new(registry.clone()),
    );

    let interval = config.registry.heartbeat_interval();
    for wt in &config.scaler.worker_types {
        for i in 1..=wt.min_instances.max(1) {
            let id = format!("{}-{}", wt.kind, i);
            let (transport, inbound) = broker.connect(id.clone());
            let (wbus, winbox) = MessageBus::start(
                id.clone(),
                Arc::new(transport),
                inbound,
                config.bus.clone(),
                Arc::new(StaticMembership(0)),
            );
            let worker = node::build_worker(wbus.clone(), &config, ResultCache::Local(cache.clone()));
            node::spawn_heartbeat(
                wbus,
                node::announcement(&id, &wt.kind, &[]),
                interval,
                Some(worker.clone()),
                shutdown_tx.subscribe(),
            );
            tokio::spawn(worker.run(winbox, shutdown_tx.subscribe()));
            tracing::info!(node = %id, kind = %wt.kind, "in-process worker started");
        }
    }

    // Worker processes cannot join an in-process broker, so no scaler here.
    serve(config, bus, inbox, registry, cache, false, shutdown_tx).await
}

async fn serve(
    config: HiveConfig,
    bus: MessageBus,
    inbox: Inbox,
    registry: NodeRegistry,
    cache: DistributedCache,
    allow_scaler: bool,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let tasks = TaskStore::new();
    let coordinator = Coordinator::new(
        bus.clone(),
        registry.clone(),
        tasks.clone(),
        config.coordinator.clone(),
        RetryPolicy::from(config.resilience.retry),
        EventHub::default(),
    )?;

    {
        let (bus, registry, shutdown) = (bus.clone(), registry.clone(), shutdown_tx.subscribe());
        tokio::spawn(async move {
            if let Err(e) = presence_loop(bus, registry, shutdown).await {
                tracing::error!(error = %e, "presence listener failed");
            }
        });
    }
    tokio::spawn(coordinator.clone().discovery_loop(shutdown_tx.subscribe()));
    tokio::spawn(cache.clone().sweep_loop(shutdown_tx.subscribe()));

    // The coordinator is a voter like any other node and serves cache calls
    // when it owns the cache. It runs no operations.
    let mut voter = Worker::builder(bus.clone(), config.resilience.breaker);
    if config.cache.owner == config.node.id {
        voter = voter.serve_cache(cache.clone());
    } else {
        tracing::warn!(owner = %config.cache.owner, "cache owner is another node; workers will not see this cache");
    }
    let voter = voter.build();
    tokio::spawn(voter.run(inbox, shutdown_tx.subscribe()));

    let heartbeat = node::spawn_heartbeat(
        bus,
        node::announcement(&config.node.id, &config.node.kind, &config.node.capabilities),
        config.registry.heartbeat_interval(),
        None,
        shutdown_tx.subscribe(),
    );

    let mut scaler_task: Option<JoinHandle<()>> = None;
    let scaler = if allow_scaler && config.scaler.enabled {
        let scaler = Arc::new(Scaler::new(
            config.scaler.clone(),
            Arc::new(HiveMetrics::new(tasks.clone())),
            Arc::new(
                CommandSpawner::new(config.broker.url.clone())
                    .with_cache_owner(config.node.id.clone()),
            ),
        ));
        match scaler.ensure_minimums().await {
            Ok(n) => tracing::info!(spawned = n, "worker minimums ensured"),
            Err(e) => tracing::warn!(error = %e, "could not bring workers up to minimum"),
        }
        scaler_task = Some(tokio::spawn(scaler.clone().run(shutdown_tx.subscribe())));
        Some(scaler)
    } else {
        None
    };

    let snapshot = spawn_snapshot(coordinator.clone(), cache.clone(), shutdown_tx.subscribe());

    let state = hive_api::ApiState {
        coordinator,
        cache,
        scaler,
    };
    let served = hive_api::serve(state, config.node.api_port, shutdown_tx.subscribe()).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "API server failed");
        let _ = shutdown_tx.send(());
    }

    // Let the scaler stop its workers and the heartbeat say goodbye.
    let grace = Duration::from_secs(config.scaler.shutdown_grace_secs + 1);
    if let Some(task) = scaler_task {
        let _ = tokio::time::timeout(grace, task).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), heartbeat).await;
    snapshot.abort();
    served
}

fn spawn_snapshot(
    coordinator: Coordinator,
    cache: DistributedCache,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let status = coordinator.status();
                    let online = status.agents.iter().filter(|a| a.is_online()).count();
                    let stats = cache.stats();
                    tracing::info!(
                        agents = status.agents.len(),
                        online,
                        queue_depth = status.queue.depth,
                        running_workflows = status.workflows.running,
                        dead_letters = status.dead_letters,
                        cache_entries = stats.entries,
                        cache_hit_rate = stats.hit_rate,
                        "hive snapshot"
                    );
                }
            }
        }
    })
}
