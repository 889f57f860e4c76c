//! Hive integration test harness.
//!
//! Every test runs a whole hive in-process: a coordinator, its registry and
//! a set of worker nodes, all connected through one broker. Most tests use
//! the in-memory broker; `broker_tcp` runs the same traffic over a real
//! socket on 127.0.0.1.
//!
//!   cargo test --test integration

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use hive_core::config::{BreakerSettings, BusSettings, CacheSettings, CoordinatorSettings, RegistrySettings};
use hive_core::{NodeAnnouncement, NodeMetrics, PhaseTemplate, TaskPriority, WorkflowTemplate};
use hive_services::bus::{Inbox, Membership};
use hive_services::registry::{heartbeat_loop, presence_loop};
use hive_services::worker::{EchoOperation, WorkerBuilder};
use hive_services::{
    Coordinator, DistributedCache, EventHub, LocalBroker, MessageBus, NodeRegistry, RetryPolicy,
    StaticMembership, TaskStore, Worker,
};

mod broker_tcp;
mod caching;
mod consensus;
mod messaging;
mod workflows;

// ── Settings ──────────────────────────────────────────────────────────────────

pub const COORDINATOR: &str = "coordinator";

pub fn bus_settings() -> BusSettings {
    BusSettings {
        request_timeout_ms: 5_000,
        proposal_timeout_ms: 2_000,
        deliberation_ms: 0,
    }
}

pub fn registry_settings() -> RegistrySettings {
    RegistrySettings {
        heartbeat_interval_ms: 100,
        staleness_window_ms: 10_000,
    }
}

/// Fast retries so retry tests do not sleep for long.
pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        factor: 2.0,
        max_backoff: Duration::from_millis(50),
    }
}

pub fn phase(name: &str, nodes: &[&str], types: &[&str], parallel: bool) -> PhaseTemplate {
    PhaseTemplate {
        name: name.to_string(),
        target_nodes: nodes.iter().map(|s| s.to_string()).collect(),
        target_kinds: Vec::new(),
        task_types: types.iter().map(|s| s.to_string()).collect(),
        priority: TaskPriority::Normal,
        parallel,
        continue_on_failure: false,
        max_retries: 0,
        params: serde_json::Value::Null,
    }
}

/// A phase aimed at worker kinds rather than named nodes.
pub fn kind_phase(name: &str, kinds: &[&str], types: &[&str], parallel: bool) -> PhaseTemplate {
    PhaseTemplate {
        target_kinds: kinds.iter().map(|s| s.to_string()).collect(),
        ..phase(name, &[], types, parallel)
    }
}

pub fn template(name: &str, phases: Vec<PhaseTemplate>) -> WorkflowTemplate {
    WorkflowTemplate {
        name: name.to_string(),
        phases,
    }
}

/// Poll `cond` every 20 ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Await `fut`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, fut).await {
        Ok(v) => v,
        Err(_) => panic!("did not finish within {timeout:?}"),
    }
}

// ── Cluster ───────────────────────────────────────────────────────────────────

/// A coordinator plus worker nodes sharing one in-memory broker.
///
/// Workers heartbeat onto the presence topic and the coordinator's presence
/// listener feeds them into the registry, the same path a deployed hive
/// takes. Dropping the cluster stops every loop it started.
pub struct Cluster {
    pub broker: LocalBroker,
    pub registry: NodeRegistry,
    pub coordinator: Coordinator,
    pub bus: MessageBus,
    pub cache: DistributedCache,
    shutdown: broadcast::Sender<()>,
    /// Inboxes of nodes that never answer; held so their buses stay up.
    silent: Vec<Inbox>,
    /// Coordinator inbox until [`Cluster::serve_cache`] starts consuming it.
    inbox: Option<Inbox>,
}

impl Cluster {
    pub fn new(settings: CoordinatorSettings) -> Self {
        let broker = LocalBroker::new();
        let registry = NodeRegistry::new(&registry_settings());
        let (transport, inbound) = broker.connect(COORDINATOR);
        let (bus, inbox) = MessageBus::start(
            COORDINATOR,
            Arc::new(transport),
            inbound,
            bus_settings(),
            Arc::new(registry.clone()),
        );
        let coordinator = Coordinator::new(
            bus.clone(),
            registry.clone(),
            TaskStore::new(),
            settings,
            retry_policy(),
            EventHub::default(),
        )
        .expect("valid templates");

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(presence_loop(bus.clone(), registry.clone(), shutdown.subscribe()));

        Self {
            broker,
            registry,
            coordinator,
            bus,
            cache: DistributedCache::in_memory(CacheSettings::default()),
            shutdown,
            silent: Vec::new(),
            inbox: Some(inbox),
        }
    }

    /// Answer cache calls on the coordinator's bus from `self.cache`, the
    /// way a deployed coordinator does for worker processes.
    pub fn serve_cache(&mut self) {
        let Some(inbox) = self.inbox.take() else {
            return;
        };
        let server = Worker::builder(self.bus.clone(), BreakerSettings::default())
            .serve_cache(self.cache.clone())
            .build();
        tokio::spawn(server.run(inbox, self.shutdown_rx()));
    }

    /// Cluster running only the given templates, with a short dispatch window.
    pub fn with_templates(templates: Vec<WorkflowTemplate>, dispatch_timeout_ms: u64) -> Self {
        Self::new(CoordinatorSettings {
            dispatch_timeout_ms,
            wait_for_agents_secs: 5,
            workflows: templates,
            ..CoordinatorSettings::default()
        })
    }

    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Bus for a new node on this cluster's broker.
    pub fn node_bus(&self, id: &str, membership: Arc<dyn Membership>) -> (MessageBus, Inbox) {
        let (transport, inbound) = self.broker.connect(id);
        MessageBus::start(id, Arc::new(transport), inbound, bus_settings(), membership)
    }

    /// Start a heartbeating worker that echoes every task, with the
    /// cluster's shared cache.
    pub fn spawn_worker(&self, id: &str, kind: &str) -> Worker {
        self.spawn_worker_with(id, kind, |b| b)
    }

    /// Like [`Cluster::spawn_worker`], letting the caller add operations,
    /// a voter, or anything else the builder takes.
    pub fn spawn_worker_with<F>(&self, id: &str, kind: &str, configure: F) -> Worker
    where
        F: FnOnce(WorkerBuilder) -> WorkerBuilder,
    {
        let (bus, inbox) = self.node_bus(id, Arc::new(StaticMembership(0)));
        let builder = Worker::builder(bus.clone(), BreakerSettings::default())
            .fallback(Arc::new(EchoOperation::new(id)))
            .cache(self.cache.clone())
            .deliberation(Duration::ZERO);
        let worker = configure(builder).build();
        tokio::spawn(worker.clone().run(inbox, self.shutdown_rx()));

        let node = NodeAnnouncement {
            id: id.to_string(),
            kind: kind.to_string(),
            capabilities: [kind.to_string()].into_iter().collect(),
        };
        let counters = worker.clone();
        tokio::spawn(heartbeat_loop(
            bus,
            node,
            registry_settings().heartbeat_interval(),
            move || counters.metrics(),
            self.shutdown_rx(),
        ));
        worker
    }

    /// Register a node that is online but never answers a request or a
    /// proposal.
    pub fn spawn_silent(&mut self, id: &str, kind: &str) {
        let (_bus, inbox) = self.node_bus(id, Arc::new(StaticMembership(0)));
        self.silent.push(inbox);
        self.registry
            .register(NodeAnnouncement {
                id: id.to_string(),
                kind: kind.to_string(),
                capabilities: Default::default(),
            })
            .expect("valid announcement");
        self.registry
            .heartbeat(id, NodeMetrics::default())
            .expect("registered");
    }

    /// Wait until every id is online in the registry.
    pub async fn wait_online(&self, ids: &[&str]) -> Result<()> {
        let registry = self.registry.clone();
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        wait_until(Duration::from_secs(5), || ids.iter().all(|id| registry.is_online(id))).await
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
