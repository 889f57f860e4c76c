//! Message routing between nodes.
//!
//! The [`Router`] is the broker's core: it binds node ids to delivery
//! channels and decides who receives each message. It is shared by the
//! in-process [`LocalBroker`] and the TCP broker server in `tcp`.
//!
//! Routing rules:
//!   - publish: current subscribers of the topic, publisher excluded
//!   - broadcast / consensus-proposal: every other connected node
//!   - everything else: the `to` node, dropped if it is not connected

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use hive_core::{Frame, HiveError, Message, MessageBody, NodeId, Result};

/// Channel a connected node receives routed messages on.
pub type Inbound = mpsc::UnboundedReceiver<Message>;

/// Outbound half of a node's broker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the broker. Errors surface immediately.
    async fn send(&self, frame: Frame) -> Result<()>;
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct Router {
    connections: DashMap<NodeId, Connection>,
    /// topic → subscribed node ids
    topics: DashMap<String, HashSet<NodeId>>,
    next_conn: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `node_id` to a delivery channel. A reconnecting node replaces its
    /// previous binding. Returns the connection id for [`detach`](Self::detach).
    pub fn attach(&self, node_id: &str, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        if self
            .connections
            .insert(node_id.to_string(), Connection { id, tx })
            .is_some()
        {
            tracing::debug!(node = node_id, "connection replaced");
        }
        tracing::info!(node = node_id, conn = id, "node attached");
        id
    }

    /// Remove a binding, unless the node has since reconnected.
    pub fn detach(&self, node_id: &str, conn: u64) {
        let removed = self
            .connections
            .remove_if(node_id, |_, c| c.id == conn)
            .is_some();
        if removed {
            for mut subs in self.topics.iter_mut() {
                subs.remove(node_id);
            }
            tracing::info!(node = node_id, conn, "node detached");
        }
    }

    pub fn is_attached(&self, node_id: &str, conn: u64) -> bool {
        self.connections
            .get(node_id)
            .map(|c| c.id == conn)
            .unwrap_or(false)
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscribe(&self, node_id: &str, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(node_id.to_string());
    }

    pub fn unsubscribe(&self, node_id: &str, topic: &str) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(node_id);
        }
    }

    /// Deliver a message. Returns how many nodes it was handed to.
    pub fn route(&self, message: Message) -> usize {
        let recipients: Vec<NodeId> = match &message.body {
            MessageBody::Publish { topic, .. } => self
                .topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|n| **n != message.from)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            MessageBody::Broadcast { .. } | MessageBody::ConsensusProposal { .. } => self
                .connections
                .iter()
                .filter(|e| *e.key() != message.from)
                .map(|e| e.key().clone())
                .collect(),
            MessageBody::Request { .. }
            | MessageBody::Response { .. }
            | MessageBody::Direct { .. }
            | MessageBody::ConsensusVote { .. } => message.to.iter().cloned().collect(),
        };

        let mut delivered = 0;
        for node in &recipients {
            match self.connections.get(node) {
                Some(conn) if conn.tx.send(message.clone()).is_ok() => delivered += 1,
                _ => tracing::debug!(
                    node = %node,
                    msg = %message.id,
                    pattern = ?message.pattern(),
                    "recipient not connected, dropped"
                ),
            }
        }
        delivered
    }

    /// Apply one frame received from `node_id`.
    pub fn handle_frame(&self, node_id: &str, frame: Frame) -> Result<()> {
        match frame {
            Frame::Hello { .. } => Err(HiveError::Validation(
                "hello frame after handshake".into(),
            )),
            Frame::Subscribe { topic } => {
                self.subscribe(node_id, &topic);
                Ok(())
            }
            Frame::Unsubscribe { topic } => {
                self.unsubscribe(node_id, &topic);
                Ok(())
            }
            Frame::Message { message } => {
                if message.from != node_id {
                    return Err(HiveError::Validation(format!(
                        "node {node_id} sent a message from {}",
                        message.from
                    )));
                }
                message.validate()?;
                self.route(message);
                Ok(())
            }
        }
    }
}

// ── In-process broker ─────────────────────────────────────────────────────────

/// Broker living in the current process. Used by tests and single-process
/// deployments; nodes talk to it through [`LocalTransport`].
#[derive(Clone, Default)]
pub struct LocalBroker {
    router: Arc<Router>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn connect(&self, node_id: impl Into<NodeId>) -> (LocalTransport, Inbound) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self.router.attach(&node_id, tx);
        (
            LocalTransport {
                node_id,
                conn,
                router: self.router.clone(),
            },
            rx,
        )
    }

    /// Drop a node's connection, as if its socket died.
    pub fn disconnect(&self, node_id: &str) {
        if let Some(conn) = self.router.connections.get(node_id).map(|c| c.id) {
            self.router.detach(node_id, conn);
        }
    }
}

pub struct LocalTransport {
    node_id: NodeId,
    conn: u64,
    router: Arc<Router>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.router.is_attached(&self.node_id, self.conn) {
            return Err(HiveError::Transport(format!(
                "{} is not connected to the broker",
                self.node_id
            )));
        }
        match frame {
            Frame::Hello { .. } => Ok(()),
            other => self.router.handle_frame(&self.node_id, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish(from: &str, topic: &str) -> Message {
        Message::new(
            from,
            None,
            MessageBody::Publish {
                topic: topic.into(),
                payload: json!(1),
            },
        )
    }

    #[test]
    fn publisher_never_receives_own_publication() {
        let router = Router::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        router.attach("a", a_tx);
        router.attach("b", b_tx);
        router.subscribe("a", "t");
        router.subscribe("b", "t");

        assert_eq!(router.route(publish("a", "t")), 1);
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn broadcast_excludes_sender() {
        let router = Router::new();
        let mut rxs = Vec::new();
        for n in ["a", "b", "c"] {
            let (tx, rx) = mpsc::unbounded_channel();
            router.attach(n, tx);
            rxs.push(rx);
        }
        let msg = Message::new("a", None, MessageBody::Broadcast { payload: json!({}) });
        assert_eq!(router.route(msg), 2);
        assert!(rxs[0].try_recv().is_err());
    }

    #[test]
    fn unknown_target_is_dropped() {
        let router = Router::new();
        let msg = Message::new(
            "a",
            Some("ghost".into()),
            MessageBody::Direct { payload: json!({}) },
        );
        assert_eq!(router.route(msg), 0);
    }

    #[test]
    fn stale_detach_keeps_new_connection() {
        let router = Router::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let old = router.attach("a", tx1);
        let new = router.attach("a", tx2);
        router.detach("a", old);
        assert!(router.is_attached("a", new));
    }

    #[test]
    fn spoofed_sender_is_rejected() {
        let router = Router::new();
        let frame = Frame::Message {
            message: publish("mallory", "t"),
        };
        assert!(matches!(
            router.handle_frame("a", frame),
            Err(HiveError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_transport_reports_transport_error() {
        let broker = LocalBroker::new();
        let (transport, _rx) = broker.connect("a");
        broker.disconnect("a");
        let err = transport
            .send(Frame::Subscribe { topic: "t".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Transport(_)));
    }
}
