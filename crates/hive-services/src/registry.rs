//! Node registry: heartbeat-based presence and capability directory.
//!
//! Nodes are upserted by id. `online` is never stored: it is derived at query
//! time from the age of the last heartbeat against the staleness window, so a
//! node that stops heartbeating drops offline without anyone mutating it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use hive_core::config::RegistrySettings;
use hive_core::message::now_ms;
use hive_core::{HiveError, NodeAnnouncement, NodeId, NodeMetrics, PresenceEvent, Result};

use crate::bus::{Membership, MessageBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Tracked state for a registered node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub kind: String,
    pub capabilities: BTreeSet<String>,
    pub metrics: NodeMetrics,
    /// Unix ms of the last heartbeat, for reporting.
    pub last_heartbeat_ms: u64,
    /// Monotonic time of the last heartbeat, for staleness.
    pub last_seen: Instant,
}

/// Point-in-time view of a node, as returned by [`NodeRegistry::discover`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    pub capabilities: BTreeSet<String>,
    pub status: NodeStatus,
    pub last_heartbeat: u64,
    pub metrics: NodeMetrics,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn can_run(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type) || self.kind == task_type
    }
}

/// Shared between the presence listener, the coordinator and the scaler.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<NodeId, NodeEntry>>,
    staleness: Duration,
}

impl NodeRegistry {
    pub fn new(settings: &RegistrySettings) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            staleness: settings.staleness_window(),
        }
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness
    }

    /// Idempotent upsert. Re-registering counts as a heartbeat and keeps the
    /// last known metrics.
    pub fn register(&self, node: NodeAnnouncement) -> Result<()> {
        if node.id.trim().is_empty() {
            return Err(HiveError::Validation("node id is empty".into()));
        }
        let now = Instant::now();
        let mut capabilities = node.capabilities;
        if capabilities.is_empty() && !node.kind.is_empty() {
            capabilities.insert(node.kind.clone());
        }
        self.nodes
            .entry(node.id.clone())
            .and_modify(|e| {
                e.kind = node.kind.clone();
                e.capabilities = capabilities.clone();
                e.last_seen = now;
                e.last_heartbeat_ms = now_ms();
            })
            .or_insert_with(|| {
                tracing::info!(node = %node.id, kind = %node.kind, "node registered");
                NodeEntry {
                    id: node.id.clone(),
                    kind: node.kind.clone(),
                    capabilities,
                    metrics: NodeMetrics::default(),
                    last_heartbeat_ms: now_ms(),
                    last_seen: now,
                }
            });
        Ok(())
    }

    pub fn heartbeat(&self, node_id: &str, metrics: NodeMetrics) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| HiveError::NotFound(format!("node {node_id}")))?;
        entry.metrics = metrics;
        entry.last_seen = Instant::now();
        entry.last_heartbeat_ms = now_ms();
        Ok(())
    }

    pub fn deregister(&self, node_id: &str) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            tracing::info!(node = node_id, "node deregistered");
        }
        removed
    }

    fn snapshot(&self, entry: &NodeEntry, now: Instant) -> Node {
        let status = if now.saturating_duration_since(entry.last_seen) < self.staleness {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        };
        Node {
            id: entry.id.clone(),
            kind: entry.kind.clone(),
            capabilities: entry.capabilities.clone(),
            status,
            last_heartbeat: entry.last_heartbeat_ms,
            metrics: entry.metrics.clone(),
        }
    }

    /// Snapshot of every registered node, sorted by id.
    pub fn discover(&self) -> Vec<Node> {
        let now = Instant::now();
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|e| self.snapshot(e.value(), now))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        let now = Instant::now();
        self.nodes.get(node_id).map(|e| self.snapshot(e.value(), now))
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.get(node_id).map(|n| n.is_online()).unwrap_or(false)
    }

    pub fn online(&self) -> Vec<Node> {
        self.discover().into_iter().filter(Node::is_online).collect()
    }

    /// Online nodes of one worker type.
    pub fn online_of_kind(&self, kind: &str) -> Vec<Node> {
        self.discover()
            .into_iter()
            .filter(|n| n.is_online() && n.kind == kind)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply one presence event received from the bus.
    pub fn apply(&self, event: PresenceEvent) -> Result<()> {
        match event {
            PresenceEvent::Heartbeat { node, metrics } => {
                let id = node.id.clone();
                self.register(node)?;
                self.heartbeat(&id, metrics)
            }
            PresenceEvent::Goodbye { node_id } => {
                self.deregister(&node_id);
                Ok(())
            }
        }
    }
}

impl Membership for NodeRegistry {
    fn eligible_voters(&self, proposer: &str) -> usize {
        self.online().iter().filter(|n| n.id != proposer).count()
    }
}

/// Feed presence events from the bus into the registry until shutdown.
pub async fn presence_loop(
    bus: MessageBus,
    registry: NodeRegistry,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut sub = bus.subscribe(hive_core::PRESENCE_TOPIC).await?;
    tracing::info!("presence listener started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("presence listener shutting down");
                return Ok(());
            }

            published = sub.recv() => {
                let Some(published) = published else {
                    return Err(HiveError::Transport("presence subscription closed".into()));
                };
                let applied = serde_json::from_value::<PresenceEvent>(published.payload)
                    .map_err(HiveError::from)
                    .and_then(|event| registry.apply(event));
                if let Err(e) = applied {
                    tracing::warn!(from = %published.from, error = %e, "bad presence event");
                }
            }
        }
    }
}

/// Publish this node's heartbeat every interval, and a goodbye on shutdown.
///
/// `metrics` is sampled fresh for each heartbeat. Send failures are logged
/// and retried on the next tick.
pub async fn heartbeat_loop<F>(
    bus: MessageBus,
    node: NodeAnnouncement,
    interval: Duration,
    mut metrics: F,
    mut shutdown: broadcast::Receiver<()>,
) where
    F: FnMut() -> NodeMetrics + Send,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let goodbye = PresenceEvent::Goodbye { node_id: node.id.clone() };
                if let Ok(payload) = serde_json::to_value(&goodbye) {
                    let _ = bus.publish(hive_core::PRESENCE_TOPIC, payload).await;
                }
                tracing::info!(node = %node.id, "heartbeat stopped");
                return;
            }

            _ = ticker.tick() => {
                let event = PresenceEvent::Heartbeat { node: node.clone(), metrics: metrics() };
                let payload = match serde_json::to_value(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "unencodable heartbeat");
                        continue;
                    }
                };
                if let Err(e) = bus.publish(hive_core::PRESENCE_TOPIC, payload).await {
                    tracing::warn!(node = %node.id, error = %e, "heartbeat not sent");
                }
            }
        }
    }
}
