//! Message bus: request/response, pub/sub, broadcast and consensus on top of
//! a broker [`Transport`].
//!
//! One dispatch task per bus drains the broker connection:
//!   - responses complete the matching pending request (first one wins)
//!   - publications fan out to local subscriptions
//!   - votes are tallied against open proposals
//!   - requests, direct messages, broadcasts and proposals go to the [`Inbox`]
//!
//! The bus never retries a send. Transport errors surface to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use hive_core::config::BusSettings;
use hive_core::{Frame, HiveError, Message, MessageBody, NodeId, Result, Vote};

use crate::broker::{Inbound, Transport};

/// How many nodes could vote on a proposal.
pub trait Membership: Send + Sync + 'static {
    /// Online nodes other than `proposer`.
    fn eligible_voters(&self, proposer: &str) -> usize;
}

/// Fixed voter count.
#[derive(Debug, Clone, Copy)]
pub struct StaticMembership(pub usize);

impl Membership for StaticMembership {
    fn eligible_voters(&self, _proposer: &str) -> usize {
        self.0
    }
}

/// Messages the bus hands to the node's own logic.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer with [`MessageBus::respond`] using `id`.
    Request {
        id: Uuid,
        from: NodeId,
        payload: Value,
    },
    Direct {
        from: NodeId,
        payload: Value,
    },
    Broadcast {
        from: NodeId,
        payload: Value,
    },
    /// Answer with [`MessageBus::vote`] using `id`.
    Proposal {
        id: Uuid,
        from: NodeId,
        payload: Value,
    },
}

pub type Inbox = mpsc::UnboundedReceiver<Incoming>;

/// One publication delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub from: NodeId,
    pub topic: String,
    pub payload: Value,
}

/// Ordered stream of publications on one topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Published>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next publication, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Published> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalOutcome {
    pub proposal_id: Uuid,
    pub accepted: bool,
    pub yes: usize,
    pub no: usize,
    pub quorum: usize,
    pub timed_out: bool,
}

#[derive(Default)]
struct Ballot {
    votes: Mutex<HashMap<NodeId, Vote>>,
    notify: Notify,
}

impl Ballot {
    fn tally(&self) -> (usize, usize) {
        let votes = self.votes.lock().unwrap_or_else(|p| p.into_inner());
        let yes = votes.values().filter(|v| **v == Vote::Yes).count();
        (yes, votes.len() - yes)
    }
}

struct BusInner {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    settings: BusSettings,
    membership: Arc<dyn Membership>,
    pending: DashMap<Uuid, oneshot::Sender<Value>>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Published>>>,
    ballots: DashMap<Uuid, Arc<Ballot>>,
}

/// Cheap to clone; every clone shares the same connection and state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Start the dispatch task over a broker connection.
    pub fn start(
        node_id: impl Into<NodeId>,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        settings: BusSettings,
        membership: Arc<dyn Membership>,
    ) -> (Self, Inbox) {
        let inner = Arc::new(BusInner {
            node_id: node_id.into(),
            transport,
            settings,
            membership,
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            ballots: DashMap::new(),
        });
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(inner.clone(), inbound, inbox_tx));
        (Self { inner }, inbox_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    async fn send(&self, to: Option<NodeId>, body: MessageBody) -> Result<Message> {
        let message = Message::new(self.inner.node_id.clone(), to, body);
        message.validate()?;
        self.inner
            .transport
            .send(Frame::Message {
                message: message.clone(),
            })
            .await?;
        Ok(message)
    }

    /// Send a request and wait for its response within the default window.
    pub async fn request(&self, target: &str, payload: Value) -> Result<Value> {
        self.request_with_timeout(target, payload, self.inner.settings.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        target: &str,
        payload: Value,
        window: Duration,
    ) -> Result<Value> {
        let message = Message::new(
            self.inner.node_id.clone(),
            Some(target.to_string()),
            MessageBody::Request { payload },
        );
        let id = message.id;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if let Err(e) = self.inner.transport.send(Frame::Message { message }).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        tracing::debug!(request = %id, target, "request sent");

        match tokio::time::timeout(window, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(HiveError::Transport("bus shut down".into())),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(HiveError::timeout(format!("response from {target}"), window))
            }
        }
    }

    /// Fire-and-forget reply to a request.
    pub async fn respond(&self, request_id: Uuid, target: &str, payload: Value) -> Result<()> {
        self.send(
            Some(target.to_string()),
            MessageBody::Response {
                response_id: request_id,
                payload,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn send_direct(&self, target: &str, payload: Value) -> Result<()> {
        self.send(Some(target.to_string()), MessageBody::Direct { payload })
            .await
            .map(|_| ())
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(
            None,
            MessageBody::Publish {
                topic: topic.to_string(),
                payload,
            },
        )
        .await
        .map(|_| ())
    }

    /// Subscribe to a topic. Only the first local subscription sends a
    /// subscribe frame to the broker.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut subs = self.inner.subscribers.entry(topic.to_string()).or_default();
            subs.retain(|s| !s.is_closed());
            subs.push(tx);
            subs.len() == 1
        };
        if first {
            let sent = self
                .inner
                .transport
                .send(Frame::Subscribe {
                    topic: topic.to_string(),
                })
                .await;
            if let Err(e) = sent {
                self.inner.subscribers.remove(topic);
                return Err(e);
            }
        }
        Ok(Subscription {
            topic: topic.to_string(),
            rx,
        })
    }

    /// Drop every local subscription on `topic`.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.inner.subscribers.remove(topic).is_some() {
            self.inner
                .transport
                .send(Frame::Unsubscribe {
                    topic: topic.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    /// Deliver to every other connected node.
    pub async fn broadcast(&self, payload: Value) -> Result<()> {
        self.send(None, MessageBody::Broadcast { payload })
            .await
            .map(|_| ())
    }

    /// Propose to every other node and wait for the outcome.
    ///
    /// Quorum is a strict majority of the online nodes other than the
    /// proposer. The proposal resolves as soon as that many nodes have
    /// voted, or at the proposal timeout. Accepted iff quorum was reached and
    /// yes votes outnumber no votes.
    pub async fn propose(&self, payload: Value) -> Result<ProposalOutcome> {
        self.propose_with_timeout(payload, self.inner.settings.proposal_timeout())
            .await
    }

    pub async fn propose_with_timeout(
        &self,
        payload: Value,
        window: Duration,
    ) -> Result<ProposalOutcome> {
        let eligible = self.inner.membership.eligible_voters(&self.inner.node_id);
        let quorum = eligible / 2 + 1;

        let message = Message::new(
            self.inner.node_id.clone(),
            None,
            MessageBody::ConsensusProposal { payload },
        );
        let proposal_id = message.id;
        let ballot = Arc::new(Ballot::default());
        self.inner.ballots.insert(proposal_id, ballot.clone());

        if let Err(e) = self.inner.transport.send(Frame::Message { message }).await {
            self.inner.ballots.remove(&proposal_id);
            return Err(e);
        }
        tracing::debug!(proposal = %proposal_id, eligible, quorum, "proposal sent");

        let deadline = Instant::now() + window;
        let mut timed_out = false;
        loop {
            let notified = ballot.notify.notified();
            let (yes, no) = ballot.tally();
            if eligible > 0 && yes + no >= quorum {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                timed_out = true;
                break;
            }
        }
        self.inner.ballots.remove(&proposal_id);

        let (yes, no) = ballot.tally();
        let accepted = eligible > 0 && yes + no >= quorum && yes > no;
        tracing::info!(proposal = %proposal_id, yes, no, quorum, accepted, timed_out, "proposal resolved");
        Ok(ProposalOutcome {
            proposal_id,
            accepted,
            yes,
            no,
            quorum,
            timed_out,
        })
    }

    /// Vote on a proposal. Repeated votes replace earlier ones.
    pub async fn vote(&self, proposal_id: Uuid, proposer: &str, vote: Vote) -> Result<()> {
        self.send(
            Some(proposer.to_string()),
            MessageBody::ConsensusVote { proposal_id, vote },
        )
        .await
        .map(|_| ())
    }
}

async fn dispatch_loop(
    inner: Arc<BusInner>,
    mut inbound: Inbound,
    inbox: mpsc::UnboundedSender<Incoming>,
) {
    while let Some(message) = inbound.recv().await {
        let from = message.from;
        let incoming = match message.body {
            MessageBody::Response {
                response_id,
                payload,
            } => {
                match inner.pending.remove(&response_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(payload);
                    }
                    None => tracing::debug!(
                        request = %response_id,
                        from = %from,
                        "late or duplicate response ignored"
                    ),
                }
                continue;
            }
            MessageBody::Publish { topic, payload } => {
                if let Some(mut subs) = inner.subscribers.get_mut(&topic) {
                    let published = Published {
                        from,
                        topic: topic.clone(),
                        payload,
                    };
                    subs.retain(|s| s.send(published.clone()).is_ok());
                }
                continue;
            }
            MessageBody::ConsensusVote { proposal_id, vote } => {
                if from == inner.node_id {
                    continue;
                }
                match inner.ballots.get(&proposal_id) {
                    Some(ballot) => {
                        ballot
                            .votes
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(from, vote);
                        ballot.notify.notify_one();
                    }
                    None => tracing::debug!(proposal = %proposal_id, "vote for closed proposal"),
                }
                continue;
            }
            MessageBody::Request { payload } => Incoming::Request {
                id: message.id,
                from,
                payload,
            },
            MessageBody::Direct { payload } => Incoming::Direct { from, payload },
            MessageBody::Broadcast { payload } => Incoming::Broadcast { from, payload },
            MessageBody::ConsensusProposal { payload } => Incoming::Proposal {
                id: message.id,
                from,
                payload,
            },
        };
        // Nobody reading the inbox is fine; the node only uses pub/sub.
        let _ = inbox.send(incoming);
    }

    tracing::info!(node = %inner.node_id, "broker connection closed, bus stopped");
    inner.pending.clear();
    inner.subscribers.clear();
}
