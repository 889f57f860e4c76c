//! Worker node: executes dispatched tasks and votes on proposals.
//!
//! A worker drains its bus [`Inbox`]. `execute-task` requests wait for a
//! slot on a bounded pool, highest priority first, go through the result
//! cache when the task allows it and through a circuit breaker around the
//! operation itself. The reply is always a [`TaskOutcome`], so the
//! coordinator sees failures as `success: false` rather than a silent
//! timeout.
//!
//! The node that owns the result cache also answers `cache` requests from
//! every other worker.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use hive_core::config::BreakerSettings;
use hive_core::task::{request_type, CACHE_CALL};
use hive_core::{
    CacheCall, CacheReply, ExecuteTask, HiveError, NodeId, NodeMetrics, Result, TaskOutcome,
    TaskPayload, TaskPriority, Vote,
};

use crate::bus::{Incoming, Inbox, MessageBus};
use crate::cache::{DistributedCache, RemoteCache, ResultCache};
use crate::resilience::CircuitBreaker;

const DEFAULT_CONCURRENCY: usize = 4;

/// One kind of work a worker knows how to complete.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    async fn execute(&self, task: &TaskPayload) -> Result<Value>;
}

/// Returns the task's params tagged with the executing node.
pub struct EchoOperation {
    node_id: String,
}

impl EchoOperation {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl Operation for EchoOperation {
    async fn execute(&self, task: &TaskPayload) -> Result<Value> {
        Ok(json!({
            "taskId": task.id,
            "type": task.task_type,
            "node": self.node_id,
            "params": task.params,
        }))
    }
}

/// Runs a subprocess. Params shape: `{"cmd": "...", "args": ["..."]}`.
pub struct CommandOperation {
    work_dir: PathBuf,
}

impl CommandOperation {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl Operation for CommandOperation {
    async fn execute(&self, task: &TaskPayload) -> Result<Value> {
        let cmd = task
            .params
            .get("cmd")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HiveError::Validation("params missing \"cmd\" string".into()))?;
        let args: Vec<&str> = task
            .params
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            HiveError::TaskFailure(format!(
                "cannot create work dir {}: {e}",
                self.work_dir.display()
            ))
        })?;

        let output = tokio::process::Command::new(cmd)
            .args(&args)
            .current_dir(&self.work_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HiveError::TaskFailure(format!("failed to spawn '{cmd}': {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(json!({ "exitCode": 0, "stdout": stdout, "stderr": stderr }))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Err(HiveError::TaskFailure(format!(
                "exit code {}: {}",
                code,
                if stderr.is_empty() { &stdout } else { &stderr }
            )))
        }
    }
}

/// Decides how this node votes on a proposal.
pub trait Voter: Send + Sync + 'static {
    fn vote(&self, proposer: &str, payload: &Value) -> Vote;
}

/// Votes yes on everything.
pub struct AcceptAll;

impl Voter for AcceptAll {
    fn vote(&self, _proposer: &str, _payload: &Value) -> Vote {
        Vote::Yes
    }
}

// ── Admission ─────────────────────────────────────────────────────────────────

struct Waiter {
    priority: TaskPriority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

// Max-heap order: higher priority first, then arrival order.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

struct GateState {
    free: usize,
    waiting: BinaryHeap<Waiter>,
    next_seq: u64,
}

/// Counting semaphore whose waiters are served by task priority, FIFO
/// within one priority.
pub struct PriorityGate {
    state: Mutex<GateState>,
}

/// Returned to the gate on drop.
pub struct GatePermit {
    gate: Arc<PriorityGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl PriorityGate {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                free: permits,
                waiting: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn acquire(self: &Arc<Self>, priority: TaskPriority) -> GatePermit {
        let rx = {
            let mut state = self.lock();
            if state.free > 0 && state.waiting.is_empty() {
                state.free -= 1;
                return GatePermit { gate: self.clone() };
            }
            let (tx, rx) = oneshot::channel();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.waiting.push(Waiter { priority, seq, tx });
            rx
        };
        // The sender lives in the heap until release hands the slot over.
        let _ = rx.await;
        GatePermit { gate: self.clone() }
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiting.pop() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        state.free += 1;
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn available(&self) -> usize {
        self.lock().free
    }
}

#[derive(Default)]
struct WorkerCounters {
    active: AtomicU32,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct WorkerInner {
    bus: MessageBus,
    operations: HashMap<String, Arc<dyn Operation>>,
    fallback: Option<Arc<dyn Operation>>,
    cache: Option<ResultCache>,
    /// Present on the node that owns the shared cache.
    served_cache: Option<DistributedCache>,
    breaker: CircuitBreaker,
    permits: Arc<PriorityGate>,
    voter: Arc<dyn Voter>,
    deliberation: Duration,
    counters: WorkerCounters,
}

/// Builder for a [`Worker`].
pub struct WorkerBuilder {
    bus: MessageBus,
    breaker: BreakerSettings,
    operations: HashMap<String, Arc<dyn Operation>>,
    fallback: Option<Arc<dyn Operation>>,
    cache: Option<ResultCache>,
    served_cache: Option<DistributedCache>,
    voter: Arc<dyn Voter>,
    concurrency: usize,
    deliberation: Duration,
}

impl WorkerBuilder {
    /// Serve tasks of `task_type` with `op`.
    pub fn operation(mut self, task_type: impl Into<String>, op: Arc<dyn Operation>) -> Self {
        self.operations.insert(task_type.into(), op);
        self
    }

    /// Serve every task type without a dedicated operation.
    pub fn fallback(mut self, op: Arc<dyn Operation>) -> Self {
        self.fallback = Some(op);
        self
    }

    /// Memoize through a cache in this process.
    pub fn cache(self, cache: DistributedCache) -> Self {
        self.result_cache(ResultCache::Local(cache))
    }

    pub fn result_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Memoize through the cache held by `owner`, over this worker's bus.
    pub fn shared_cache(mut self, owner: impl Into<NodeId>, window: Duration) -> Self {
        self.cache = Some(ResultCache::Remote(RemoteCache::new(
            self.bus.clone(),
            owner,
            window,
        )));
        self
    }

    /// Answer other nodes' cache calls from `cache`.
    pub fn serve_cache(mut self, cache: DistributedCache) -> Self {
        self.served_cache = Some(cache);
        self
    }

    pub fn voter(mut self, voter: Arc<dyn Voter>) -> Self {
        self.voter = voter;
        self
    }

    /// Concurrent tasks. 0 means one per available CPU.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn deliberation(mut self, window: Duration) -> Self {
        self.deliberation = window;
        self
    }

    pub fn build(self) -> Worker {
        let permits = if self.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_CONCURRENCY)
        } else {
            self.concurrency
        };
        let name = format!("worker:{}", self.bus.node_id());
        Worker {
            inner: Arc::new(WorkerInner {
                bus: self.bus,
                operations: self.operations,
                fallback: self.fallback,
                cache: self.cache,
                served_cache: self.served_cache,
                breaker: CircuitBreaker::new(name, self.breaker),
                permits: PriorityGate::new(permits),
                voter: self.voter,
                deliberation: self.deliberation,
                counters: WorkerCounters::default(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn builder(bus: MessageBus, breaker: BreakerSettings) -> WorkerBuilder {
        let deliberation = bus.settings().deliberation();
        WorkerBuilder {
            bus,
            breaker,
            operations: HashMap::new(),
            fallback: None,
            cache: None,
            served_cache: None,
            voter: Arc::new(AcceptAll),
            concurrency: DEFAULT_CONCURRENCY,
            deliberation,
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.bus.node_id()
    }

    /// Task counters for heartbeats.
    pub fn metrics(&self) -> NodeMetrics {
        let c = &self.inner.counters;
        NodeMetrics {
            active_tasks: c.active.load(Ordering::Relaxed),
            completed_tasks: c.completed.load(Ordering::Relaxed),
            failed_tasks: c.failed.load(Ordering::Relaxed),
            pid: Some(std::process::id()),
            ..NodeMetrics::default()
        }
    }

    /// Execute one task and build its outcome. Never fails: errors become
    /// `success: false`.
    pub async fn execute(&self, task: &TaskPayload) -> TaskOutcome {
        let inner = &self.inner;
        inner.counters.active.fetch_add(1, Ordering::Relaxed);
        let result = self.execute_inner(task).await;
        inner.counters.active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(value) => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::success(value)
            }
            Err(e) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task_id = %task.id, task_type = %task.task_type, error = %e, "task failed");
                TaskOutcome::failure(e.to_string())
            }
        }
    }

    async fn execute_inner(&self, task: &TaskPayload) -> Result<Value> {
        let inner = &self.inner;
        let cache = inner.cache.as_ref().filter(|_| task.cacheable);

        if let Some(c) = cache {
            if let Some(hit) = c.lookup(task).await {
                tracing::debug!(task_id = %task.id, "served from cache");
                return Ok(hit);
            }
        }

        let op = inner
            .operations
            .get(&task.task_type)
            .or(inner.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                HiveError::Validation(format!("no operation for task type {:?}", task.task_type))
            })?;

        let value = inner
            .breaker
            .call(op.execute(task), || {
                Err(HiveError::TaskFailure(format!(
                    "circuit open on {}",
                    inner.bus.node_id()
                )))
            })
            .await?;

        if let Some(c) = cache {
            c.store(task, &value).await;
        }
        Ok(value)
    }

    fn serve_cache_call(&self, payload: &Value) -> CacheReply {
        let Some(cache) = &self.inner.served_cache else {
            return CacheReply {
                error: Some(format!("{} does not hold the result cache", self.node_id())),
                ..CacheReply::default()
            };
        };
        match CacheCall::from_payload(payload) {
            Ok(call) => cache.serve(call.call),
            Err(e) => CacheReply {
                error: Some(e.to_string()),
                ..CacheReply::default()
            },
        }
    }

    fn handle_request(&self, id: Uuid, from: String, payload: Value) {
        let worker = self.clone();
        tokio::spawn(async move {
            let reply = if matches!(request_type(&payload), Ok(CACHE_CALL)) {
                serde_json::to_value(worker.serve_cache_call(&payload))
            } else {
                let outcome = match ExecuteTask::from_payload(&payload) {
                    Ok(exec) => {
                        let _permit = worker.inner.permits.acquire(exec.task.priority).await;
                        tracing::debug!(task_id = %exec.task.id, from = %from, "executing");
                        worker.execute(&exec.task).await
                    }
                    Err(e) => TaskOutcome::failure(e.to_string()),
                };
                serde_json::to_value(&outcome)
            };
            let reply = match reply {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "unencodable outcome");
                    return;
                }
            };
            if let Err(e) = worker.inner.bus.respond(id, &from, reply).await {
                tracing::warn!(request = %id, to = %from, error = %e, "response not sent");
            }
        });
    }

    fn handle_proposal(&self, id: Uuid, from: String, payload: Value) {
        let worker = self.clone();
        tokio::spawn(async move {
            if !worker.inner.deliberation.is_zero() {
                tokio::time::sleep(worker.inner.deliberation).await;
            }
            let vote = worker.inner.voter.vote(&from, &payload);
            tracing::debug!(proposal = %id, proposer = %from, ?vote, "voting");
            if let Err(e) = worker.inner.bus.vote(id, &from, vote).await {
                tracing::warn!(proposal = %id, error = %e, "vote not sent");
            }
        });
    }

    /// Serve the inbox until shutdown or until the bus goes away.
    pub async fn run(self, mut inbox: Inbox, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(node = %self.node_id(), "worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(node = %self.node_id(), "worker shutting down");
                    return;
                }
                incoming = inbox.recv() => {
                    let Some(incoming) = incoming else {
                        tracing::warn!(node = %self.node_id(), "bus closed");
                        return;
                    };
                    match incoming {
                        Incoming::Request { id, from, payload } => self.handle_request(id, from, payload),
                        Incoming::Proposal { id, from, payload } => self.handle_proposal(id, from, payload),
                        Incoming::Direct { from, payload } => {
                            tracing::debug!(from = %from, %payload, "direct message");
                        }
                        Incoming::Broadcast { from, payload } => {
                            tracing::debug!(from = %from, %payload, "broadcast");
                        }
                    }
                }
            }
        }
    }
}
