//! Event hub: in-process realtime events for the API's SSE stream.
//!
//! Events are lost when nobody listens; slow listeners skip ahead.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::registry::Node;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HiveEvent {
    #[serde(rename_all = "camelCase")]
    SpawnActivated {
        agents_online: usize,
        agents_expected: usize,
        degraded: bool,
    },
    SpawnDeactivated,
    #[serde(rename_all = "camelCase")]
    WorkflowStarted {
        workflow_id: String,
        workflow_type: String,
    },
    #[serde(rename_all = "camelCase")]
    WorkflowFinished {
        workflow_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AgentStatusUpdate {
        agents: Vec<Node>,
    },
}

#[derive(Clone)]
pub struct EventHub {
    sender: Arc<broadcast::Sender<HiveEvent>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, event: HiveEvent) {
        tracing::debug!(?event, "event");
        if self.sender.send(event).is_err() {
            tracing::trace!("no event listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HiveEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_kebab_tagged() {
        let e = HiveEvent::WorkflowStarted {
            workflow_id: "w".into(),
            workflow_type: "delivery".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "workflow-started");
        assert_eq!(v["workflowId"], "w");
        assert_eq!(
            serde_json::to_value(HiveEvent::SpawnDeactivated).unwrap()["type"],
            "spawn-deactivated"
        );
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        hub.emit(HiveEvent::SpawnDeactivated);
        assert_eq!(rx.recv().await.unwrap(), HiveEvent::SpawnDeactivated);
    }

    #[test]
    fn emit_without_listeners_is_fine() {
        let hub = EventHub::new(1);
        hub.emit(HiveEvent::SpawnDeactivated);
        assert_eq!(hub.listener_count(), 0);
    }
}
