//! TCP broker: newline-delimited JSON frames over plain sockets.
//!
//! Server side: [`BrokerServer`] accepts connections, expects a `Hello` frame
//! first, then feeds every frame into the shared [`Router`].
//!
//! Client side: [`TcpTransport`] keeps one connection open, reconnecting with
//! capped exponential backoff and replaying its subscriptions after every
//! reconnect. Messages sent while disconnected fail immediately; a frame
//! whose write fails is written first on the next connection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use hive_core::{Frame, HiveError, Message, NodeId, Result};

use crate::broker::{Inbound, Router, Transport};
use crate::resilience::RetryPolicy;

/// Longest accepted frame line.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// A connection that sends nothing for this long after connecting is dropped.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type LineStream = Framed<TcpStream, LinesCodec>;

fn framed(stream: TcpStream) -> LineStream {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
}

/// `tcp://host:port` or bare `host:port`.
pub fn broker_addr(url: &str) -> Result<String> {
    let addr = url.strip_prefix("tcp://").unwrap_or(url);
    if addr.is_empty() || !addr.contains(':') {
        return Err(HiveError::Config(format!("invalid broker url {url:?}")));
    }
    Ok(addr.to_string())
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct BrokerServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: broadcast::Receiver<()>,
}

impl BrokerServer {
    pub async fn bind(
        addr: &str,
        router: Arc<Router>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HiveError::Transport(format!("bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            router,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| HiveError::Transport(e.to_string()))
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "broker listening");
        let cancel = CancellationToken::new();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("broker shutting down");
                    cancel.cancel();
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let router = self.router.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, router, cancel).await {
                            tracing::debug!(%peer, error = %e, "connection closed");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = framed(stream);

    let node_id = match tokio::time::timeout(HELLO_TIMEOUT, lines.next()).await {
        Ok(Some(Ok(line))) => match Frame::from_line(&line)? {
            Frame::Hello { node_id } => node_id,
            other => {
                return Err(HiveError::Validation(format!(
                    "expected hello, got {other:?}"
                )))
            }
        },
        Ok(Some(Err(e))) => return Err(HiveError::Transport(e.to_string())),
        Ok(None) => return Ok(()),
        Err(_) => return Err(HiveError::timeout("hello frame", HELLO_TIMEOUT)),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = router.attach(&node_id, tx);
    let (mut sink, mut source) = lines.split();

    let writer_node = node_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = match (Frame::Message { message }).to_line() {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(node = %writer_node, error = %e, "unencodable message");
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(line)) => {
                    let outcome = Frame::from_line(&line)
                        .and_then(|frame| router.handle_frame(&node_id, frame));
                    if let Err(e) = outcome {
                        tracing::warn!(node = %node_id, error = %e, "rejected frame");
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(node = %node_id, error = %e, "read failed");
                    break;
                }
                None => break,
            },
        }
    }

    router.detach(&node_id, conn);
    writer.abort();
    Ok(())
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Shared {
    node_id: NodeId,
    connected: AtomicBool,
    subscriptions: Mutex<HashSet<String>>,
}

impl Shared {
    fn topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
    out_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Connect to the broker at `url` as `node_id`. The first connection is
    /// made before returning; later drops reconnect in the background.
    pub async fn connect(
        url: &str,
        node_id: impl Into<NodeId>,
        reconnect: RetryPolicy,
    ) -> Result<(Self, Inbound)> {
        let addr = broker_addr(url)?;
        let shared = Arc::new(Shared {
            node_id: node_id.into(),
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
        });

        let lines = open(&addr, &shared, &reconnect).await?;
        shared.connected.store(true, Ordering::SeqCst);
        tracing::info!(node = %shared.node_id, %addr, "connected to broker");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(connection_loop(
            addr,
            lines,
            shared.clone(),
            reconnect,
            out_rx,
            in_tx,
            cancel.clone(),
        ));

        Ok((
            Self {
                shared,
                out_tx,
                cancel,
            },
            in_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: Frame) -> Result<()> {
        match &frame {
            Frame::Subscribe { topic } => {
                if let Ok(mut subs) = self.shared.subscriptions.lock() {
                    subs.insert(topic.clone());
                }
            }
            Frame::Unsubscribe { topic } => {
                if let Ok(mut subs) = self.shared.subscriptions.lock() {
                    subs.remove(topic);
                }
            }
            Frame::Hello { .. } | Frame::Message { .. } => {}
        }

        if !self.is_connected() {
            // Subscription changes are replayed on reconnect.
            if matches!(frame, Frame::Subscribe { .. } | Frame::Unsubscribe { .. }) {
                return Ok(());
            }
            return Err(HiveError::Transport(format!(
                "{} is not connected to the broker",
                self.shared.node_id
            )));
        }
        self.out_tx
            .send(frame)
            .map_err(|_| HiveError::Transport("broker connection closed".into()))
    }
}

/// Dial the broker, say hello and replay subscriptions.
async fn open(addr: &str, shared: &Shared, policy: &RetryPolicy) -> Result<LineStream> {
    policy
        .retry("broker connect", move |_| async move {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| HiveError::Transport(format!("connect {addr}: {e}")))?;
            let _ = stream.set_nodelay(true);
            let mut lines = framed(stream);
            let hello = Frame::Hello {
                node_id: shared.node_id.clone(),
            };
            send_line(&mut lines, &hello).await?;
            for topic in shared.topics() {
                send_line(&mut lines, &Frame::Subscribe { topic }).await?;
            }
            Ok(lines)
        })
        .await
}

async fn send_line(lines: &mut LineStream, frame: &Frame) -> Result<()> {
    lines
        .send(frame.to_line()?)
        .await
        .map_err(|e| HiveError::Transport(e.to_string()))
}

/// Short description of a frame for log lines.
fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Hello { node_id } => format!("hello {node_id}"),
        Frame::Subscribe { topic } => format!("subscribe {topic}"),
        Frame::Unsubscribe { topic } => format!("unsubscribe {topic}"),
        Frame::Message { message } => format!("{:?} {}", message.pattern(), message.id),
    }
}

async fn connection_loop(
    addr: String,
    mut lines: LineStream,
    shared: Arc<Shared>,
    reconnect: RetryPolicy,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    in_tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    let mut unsent: Option<Frame> = None;
    loop {
        if let Some(frame) = unsent.take() {
            match send_line(&mut lines, &frame).await {
                Ok(()) => tracing::debug!(frame = %describe(&frame), "resent after reconnect"),
                Err(e) => {
                    tracing::warn!(node = %shared.node_id, frame = %describe(&frame), error = %e, "broker write failed");
                    unsent = Some(frame);
                }
            }
        }
        while unsent.is_none() {
            tokio::select! {
                _ = cancel.cancelled() => return,

                frame = out_rx.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = send_line(&mut lines, &frame).await {
                        tracing::warn!(node = %shared.node_id, frame = %describe(&frame), error = %e, "broker write failed, holding frame");
                        unsent = Some(frame);
                    }
                }

                line = lines.next() => match line {
                    Some(Ok(line)) => match Frame::from_line(&line) {
                        Ok(Frame::Message { message }) => {
                            if in_tx.send(message).is_err() {
                                return;
                            }
                        }
                        Ok(other) => tracing::debug!(?other, "ignoring non-message frame"),
                        Err(e) => tracing::warn!(error = %e, "undecodable frame from broker"),
                    },
                    Some(Err(e)) => {
                        tracing::warn!(node = %shared.node_id, error = %e, "broker read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        tracing::warn!(node = %shared.node_id, "broker connection lost, reconnecting");

        let reopened = tokio::select! {
            _ = cancel.cancelled() => return,
            r = open(&addr, &shared, &reconnect) => r,
        };
        match reopened {
            Ok(l) => {
                lines = l;
                shared.connected.store(true, Ordering::SeqCst);
                tracing::info!(node = %shared.node_id, "reconnected to broker");
            }
            Err(e) => {
                if let Some(frame) = &unsent {
                    tracing::error!(node = %shared.node_id, frame = %describe(frame), "frame dropped");
                }
                tracing::error!(node = %shared.node_id, error = %e, "giving up on broker");
                return;
            }
        }
    }
}
