//! Content-addressed result cache.
//!
//! Keys are derived from the task type, the normalized task params and the
//! optional agent id:
//!   hive:cache:{taskType}:{blake3(taskType, canonicalParams, agentId)}
//!
//! Object keys are sorted recursively before hashing, so two param objects
//! that differ only in key order share an entry. Entries have a sliding TTL
//! (refreshed on every hit) and are zstd-compressed when that saves at least
//! 10% of a value above the compression threshold.
//!
//! One node owns the entries (`cache.owner`, the coordinator by default) and
//! answers [`CacheCall`] requests on the bus. Workers in other processes use
//! a [`RemoteCache`], so every node sees one key space and an invalidation on
//! the owner evicts what later lookups anywhere would have hit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use hive_core::config::{CacheSettings, CacheStrategy};
use hive_core::keys::{canonical_json, digest_parts};
use hive_core::message::now_ms;
use hive_core::{
    CacheCall, CacheLookup, CacheOp, CacheReply, HiveError, NodeId, Result, TaskPayload,
};

use crate::bus::MessageBus;

/// Compressed output must be below this fraction of the input to be kept.
const MIN_COMPRESSION_GAIN: f64 = 0.9;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub task_type: String,
    /// Serialized size before compression.
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Digest of the uncompressed value.
    pub digest: String,
    pub compressed: bool,
    pub metadata: EntryMetadata,
    /// Unix ms when the entry was written.
    pub timestamp: u64,
    pub ttl: Duration,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Storage behind the cache. Implementations own expiry bookkeeping only;
/// statistics live in [`DistributedCache`].
pub trait CacheBackend: Send + Sync + 'static {
    /// Live entry for `key`. Expired entries are removed and reported as
    /// `Err(())` so the caller can count the eviction.
    fn get(&self, key: &str, now: Instant) -> std::result::Result<Option<CacheEntry>, ()>;
    fn put(&self, entry: CacheEntry);
    /// Push the expiry of a live entry `ttl` into the future.
    fn touch(&self, key: &str, now: Instant) -> bool;
    fn remove(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
    fn clear(&self) -> usize;
    fn purge_expired(&self, now: Instant) -> usize;
    fn entries(&self) -> Vec<CacheEntry>;
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &str, now: Instant) -> std::result::Result<Option<CacheEntry>, ()> {
        match self.entries.get(key).map(|e| e.clone()) {
            Some(e) if e.is_expired(now) => {
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                Err(())
            }
            other => Ok(other),
        }
    }

    fn put(&self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    fn touch(&self, key: &str, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(mut e) if !e.is_expired(now) => {
                e.expires_at = now + e.ttl;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn clear(&self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    Stored { compressed: bool, stored_bytes: usize },
    /// The key already held this exact value: counted as a hit, TTL
    /// refreshed, nothing rewritten. A different value replaces the entry.
    AlreadyCached,
    /// Not cached: serialization failed or the entry is over the size cap.
    Rejected(HiveError),
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. } | Self::AlreadyCached)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    bytes_saved: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub bytes_saved: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTypeUsage {
    pub entries: usize,
    pub stored_bytes: usize,
    pub original_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub entries: usize,
    pub stored_bytes: usize,
    pub original_bytes: usize,
    pub compressed_entries: usize,
    pub by_task_type: BTreeMap<String, TaskTypeUsage>,
    pub default_ttl_secs: u64,
    pub compression_threshold_bytes: usize,
    pub max_entry_bytes: usize,
    pub strategies: BTreeMap<String, CacheStrategy>,
}

#[derive(Clone)]
pub struct DistributedCache {
    backend: Arc<dyn CacheBackend>,
    settings: Arc<CacheSettings>,
    counters: Arc<Counters>,
}

/// Translate a `*` glob into an anchored regex. Everything else is literal.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| HiveError::Validation(e.to_string()))
}

impl DistributedCache {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: CacheSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn in_memory(settings: CacheSettings) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), settings)
    }

    pub fn key(&self, task_type: &str, params: &Value, agent_id: Option<&str>) -> String {
        let digest = digest_parts(&[
            task_type.as_bytes(),
            canonical_json(params).as_bytes(),
            agent_id.unwrap_or("").as_bytes(),
        ]);
        format!("{}{}:{}", self.settings.key_prefix, task_type, digest)
    }

    pub fn set(
        &self,
        task_type: &str,
        params: &Value,
        agent_id: Option<&str>,
        value: &Value,
    ) -> SetOutcome {
        let key = self.key(task_type, params, agent_id);
        let now = Instant::now();

        let raw = match serde_json::to_vec(value) {
            Ok(r) => r,
            Err(e) => return SetOutcome::Rejected(HiveError::Validation(e.to_string())),
        };
        let digest = digest_parts(&[raw.as_slice()]);

        match self.backend.get(&key, now) {
            Ok(Some(existing)) if existing.digest == digest => {
                self.backend.touch(&key, now);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache set on live key, refreshed");
                return SetOutcome::AlreadyCached;
            }
            Ok(Some(_)) => tracing::debug!(key = %key, "cached value changed, replacing"),
            Ok(None) => {}
            Err(()) => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        let strategy = self.settings.strategy_for(task_type);
        let (stored, compressed, ratio) = self.maybe_compress(&raw, strategy.compress);

        if stored.len() > self.settings.max_entry_bytes {
            tracing::warn!(key = %key, size = stored.len(), limit = self.settings.max_entry_bytes, "cache entry too large");
            return SetOutcome::Rejected(HiveError::Capacity(format!(
                "entry of {} bytes exceeds the {} byte limit",
                stored.len(),
                self.settings.max_entry_bytes
            )));
        }

        if compressed {
            self.counters
                .bytes_saved
                .fetch_add((raw.len() - stored.len()) as u64, Ordering::Relaxed);
        }
        let ttl = Duration::from_secs(strategy.ttl_secs);
        let stored_bytes = stored.len();
        self.backend.put(CacheEntry {
            key: key.clone(),
            value: stored,
            digest,
            compressed,
            metadata: EntryMetadata {
                task_type: task_type.to_string(),
                size: raw.len(),
                compression_ratio: ratio,
            },
            timestamp: now_ms(),
            ttl,
            expires_at: now + ttl,
        });
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = %key, stored_bytes, compressed, "cached");
        SetOutcome::Stored {
            compressed,
            stored_bytes,
        }
    }

    fn maybe_compress(&self, raw: &[u8], allowed: bool) -> (Vec<u8>, bool, Option<f64>) {
        if !allowed || raw.len() <= self.settings.compression_threshold_bytes {
            return (raw.to_vec(), false, None);
        }
        match zstd::bulk::compress(raw, ZSTD_LEVEL) {
            Ok(c) => {
                let ratio = c.len() as f64 / raw.len() as f64;
                if ratio < MIN_COMPRESSION_GAIN {
                    (c, true, Some(ratio))
                } else {
                    (raw.to_vec(), false, None)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "compression failed, storing raw");
                (raw.to_vec(), false, None)
            }
        }
    }

    pub fn get(&self, task_type: &str, params: &Value, agent_id: Option<&str>) -> Option<Value> {
        let key = self.key(task_type, params, agent_id);
        let now = Instant::now();
        let entry = match self.backend.get(&key, now) {
            Ok(Some(e)) => e,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(()) => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let raw = if entry.compressed {
            match zstd::bulk::decompress(&entry.value, entry.metadata.size) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "corrupt cache entry dropped");
                    self.backend.remove(&key);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        } else {
            entry.value
        };

        match serde_json::from_slice(&raw) {
            Ok(v) => {
                self.backend.touch(&key, now);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cache entry dropped");
                self.backend.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Delete every key matching a `*` glob. Patterns that do not start
    /// with the key prefix are taken relative to it.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        if pattern.is_empty() {
            return Err(HiveError::Validation("empty invalidation pattern".into()));
        }
        let full = if pattern.starts_with(&self.settings.key_prefix) {
            pattern.to_string()
        } else {
            format!("{}{}", self.settings.key_prefix, pattern)
        };
        let re = glob_to_regex(&full)?;
        let mut removed = 0;
        for key in self.backend.keys() {
            if re.is_match(&key) && self.backend.remove(&key) {
                removed += 1;
            }
        }
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::info!(pattern = %full, removed, "cache invalidated");
        Ok(removed)
    }

    pub fn clear(&self) -> usize {
        let removed = self.backend.clear();
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::info!(removed, "cache cleared");
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let removed = self.backend.purge_expired(Instant::now());
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            bytes_saved: self.counters.bytes_saved.load(Ordering::Relaxed),
            entries: self.backend.keys().len(),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    pub fn info(&self) -> CacheInfo {
        let now = Instant::now();
        let mut info = CacheInfo {
            entries: 0,
            stored_bytes: 0,
            original_bytes: 0,
            compressed_entries: 0,
            by_task_type: BTreeMap::new(),
            default_ttl_secs: self.settings.default_ttl_secs,
            compression_threshold_bytes: self.settings.compression_threshold_bytes,
            max_entry_bytes: self.settings.max_entry_bytes,
            strategies: self.settings.strategies.clone(),
        };
        for entry in self.backend.entries().into_iter().filter(|e| !e.is_expired(now)) {
            info.entries += 1;
            info.stored_bytes += entry.value.len();
            info.original_bytes += entry.metadata.size;
            if entry.compressed {
                info.compressed_entries += 1;
            }
            let usage = info
                .by_task_type
                .entry(entry.metadata.task_type.clone())
                .or_default();
            usage.entries += 1;
            usage.stored_bytes += entry.value.len();
            usage.original_bytes += entry.metadata.size;
        }
        info
    }

    /// Answer one cache call from another node.
    pub fn serve(&self, op: CacheOp) -> CacheReply {
        match op {
            CacheOp::Get { lookup } => CacheReply {
                value: self.get(&lookup.task_type, &lookup.params, lookup.agent_id.as_deref()),
                ..CacheReply::default()
            },
            CacheOp::Set { lookup, value } => {
                match self.set(&lookup.task_type, &lookup.params, lookup.agent_id.as_deref(), &value) {
                    SetOutcome::Rejected(e) => CacheReply {
                        error: Some(e.to_string()),
                        ..CacheReply::default()
                    },
                    outcome => CacheReply {
                        stored: outcome.is_stored(),
                        ..CacheReply::default()
                    },
                }
            }
        }
    }

    /// Periodically drop expired entries until shutdown.
    pub async fn sweep_loop(self, mut shutdown: broadcast::Receiver<()>) {
        if self.settings.sweep_interval_secs == 0 {
            return;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.sweep_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("cache sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "expired cache entries purged");
                    }
                }
            }
        }
    }
}

// ── Access from other nodes ──────────────────────────────────────────────────

/// Client side of the shared cache: every call is a bus request to the
/// owner. An unreachable owner degrades to a miss, never to a task failure.
#[derive(Clone)]
pub struct RemoteCache {
    bus: MessageBus,
    owner: NodeId,
    window: Duration,
}

impl RemoteCache {
    pub fn new(bus: MessageBus, owner: impl Into<NodeId>, window: Duration) -> Self {
        Self {
            bus,
            owner: owner.into(),
            window,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    async fn call(&self, op: CacheOp) -> Result<CacheReply> {
        let payload = serde_json::to_value(CacheCall::new(op))?;
        let reply = self
            .bus
            .request_with_timeout(&self.owner, payload, self.window)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn get(&self, lookup: CacheLookup) -> Option<Value> {
        match self.call(CacheOp::Get { lookup }).await {
            Ok(reply) => reply.value,
            Err(e) => {
                tracing::warn!(owner = %self.owner, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, lookup: CacheLookup, value: Value) -> bool {
        match self.call(CacheOp::Set { lookup, value }).await {
            Ok(CacheReply { error: Some(e), .. }) => {
                tracing::debug!(owner = %self.owner, error = %e, "result not cached");
                false
            }
            Ok(reply) => reply.stored,
            Err(e) => {
                tracing::warn!(owner = %self.owner, error = %e, "cache write failed");
                false
            }
        }
    }
}

/// The cache a worker memoizes through: the entries themselves when the
/// worker shares a process with the owner, the owner over the bus otherwise.
#[derive(Clone)]
pub enum ResultCache {
    Local(DistributedCache),
    Remote(RemoteCache),
}

impl ResultCache {
    pub async fn lookup(&self, task: &TaskPayload) -> Option<Value> {
        match self {
            Self::Local(c) => c.get(&task.task_type, &task.params, task.agent_id.as_deref()),
            Self::Remote(r) => r.get(CacheLookup::from(task)).await,
        }
    }

    /// Returns whether the value is now cached.
    pub async fn store(&self, task: &TaskPayload, value: &Value) -> bool {
        match self {
            Self::Local(c) => {
                let outcome = c.set(&task.task_type, &task.params, task.agent_id.as_deref(), value);
                if !outcome.is_stored() {
                    tracing::debug!(task_id = %task.id, ?outcome, "result not cached");
                }
                outcome.is_stored()
            }
            Self::Remote(r) => r.set(CacheLookup::from(task), value.clone()).await,
        }
    }
}
