//! Presence protocol: heartbeats and goodbyes published on the bus.
//!
//! Every node publishes a `Heartbeat` on [`PRESENCE_TOPIC`] at a fixed
//! interval and a `Goodbye` when it shuts down cleanly. The process that owns
//! the node registry subscribes and applies them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::NodeId;

pub const PRESENCE_TOPIC: &str = "hive.presence";

/// Identity and capability set a node announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub id: NodeId,
    /// Worker type, e.g. "research". The scaler counts instances per kind.
    pub kind: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

/// Metrics snapshot attached to every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Tasks currently executing on the node.
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Operating system process id, when the node runs as its own process.
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PresenceEvent {
    Heartbeat {
        node: NodeAnnouncement,
        metrics: NodeMetrics,
    },
    Goodbye {
        node_id: NodeId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_tagged() {
        let event = PresenceEvent::Heartbeat {
            node: NodeAnnouncement {
                id: "w1".into(),
                kind: "research".into(),
                capabilities: ["research".to_string()].into_iter().collect(),
            },
            metrics: NodeMetrics::default(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["node"]["kind"], "research");

        let back: PresenceEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
