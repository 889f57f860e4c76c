//! Auto-scaler: grows and shrinks worker pools from live metrics.
//!
//! Every interval the scaler takes one observation and makes one decision:
//!   1. scale up if ANY metric exceeds its scale-up threshold: one more
//!      instance of the worker type with the longest queue
//!   2. otherwise scale down if ALL metrics are under their scale-down
//!      thresholds: one fewer instance of the type with the shortest queue
//!      among types running more than one instance
//!
//! Instance counts stay within `[min_instances, max_instances]`. Instances
//! that exit on their own are replaced at the start of the next tick, before
//! any decision and regardless of cooldowns. Scale-up and scale-down
//! cooldowns are tracked independently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use hive_core::config::{ScalerSettings, Thresholds, WorkerTypeSettings};
use hive_core::{HiveError, Result};

use crate::metrics::{MetricSample, MetricWindow, MetricsSource, Observation};
use crate::process::ProcessSpawner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HoldReason {
    Steady,
    UpCooldown,
    DownCooldown,
    AtMax,
    AtMin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "kebab-case")]
pub enum ScaleDecision {
    Up(String),
    Down(String),
    Hold(HoldReason),
}

fn exceeds_any(s: &MetricSample, t: &Thresholds) -> bool {
    s.cpu_percent > t.cpu_percent
        || s.memory_percent > t.memory_percent
        || s.queue_depth > t.queue_depth
        || s.avg_latency_ms > t.latency_ms
}

fn under_all(s: &MetricSample, t: &Thresholds) -> bool {
    s.cpu_percent < t.cpu_percent
        && s.memory_percent < t.memory_percent
        && s.queue_depth < t.queue_depth
        && s.avg_latency_ms < t.latency_ms
}

fn cooling(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.map(|t| now.saturating_duration_since(t) < cooldown)
        .unwrap_or(false)
}

/// Pure scaling decision.
///
/// `counts` holds the running instances per worker type; types absent from
/// it count as zero. Ties on queue length go to the type declared first.
pub fn decide(
    settings: &ScalerSettings,
    obs: &Observation,
    counts: &BTreeMap<String, usize>,
    last_up: Option<Instant>,
    last_down: Option<Instant>,
    now: Instant,
) -> ScaleDecision {
    let count = |kind: &str| counts.get(kind).copied().unwrap_or(0);
    let queue = |kind: &str| obs.queue_by_type.get(kind).copied().unwrap_or(0);

    if exceeds_any(&obs.sample, &settings.scale_up) {
        if cooling(last_up, Duration::from_secs(settings.scale_up_cooldown_secs), now) {
            return ScaleDecision::Hold(HoldReason::UpCooldown);
        }
        let mut best: Option<&WorkerTypeSettings> = None;
        for wt in &settings.worker_types {
            if count(&wt.kind) >= wt.max_instances as usize {
                continue;
            }
            if best.map_or(true, |b| queue(&wt.kind) > queue(&b.kind)) {
                best = Some(wt);
            }
        }
        return match best {
            Some(wt) => ScaleDecision::Up(wt.kind.clone()),
            None => ScaleDecision::Hold(HoldReason::AtMax),
        };
    }

    if under_all(&obs.sample, &settings.scale_down) {
        if cooling(last_down, Duration::from_secs(settings.scale_down_cooldown_secs), now) {
            return ScaleDecision::Hold(HoldReason::DownCooldown);
        }
        let mut best: Option<&WorkerTypeSettings> = None;
        for wt in &settings.worker_types {
            let n = count(&wt.kind);
            if n <= 1 || n <= wt.min_instances as usize {
                continue;
            }
            if best.map_or(true, |b| queue(&wt.kind) < queue(&b.kind)) {
                best = Some(wt);
            }
        }
        return match best {
            Some(wt) => ScaleDecision::Down(wt.kind.clone()),
            None => ScaleDecision::Hold(HoldReason::AtMin),
        };
    }

    ScaleDecision::Hold(HoldReason::Steady)
}

// ── Control loop ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolReport {
    pub kind: String,
    pub instances: Vec<String>,
    pub min_instances: u32,
    pub max_instances: u32,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalerReport {
    pub enabled: bool,
    pub samples: usize,
    pub averages: MetricSample,
    pub latest: Option<MetricSample>,
    pub pools: Vec<WorkerPoolReport>,
    /// Seconds left before another scale-up is allowed. 0 = ready.
    pub scale_up_cooldown_remaining: u64,
    pub scale_down_cooldown_remaining: u64,
    pub last_decision: Option<ScaleDecision>,
}

struct ScalerState {
    window: MetricWindow,
    /// worker type → instance ids, oldest first
    instances: BTreeMap<String, Vec<String>>,
    last_up: Option<Instant>,
    last_down: Option<Instant>,
    last_queue: BTreeMap<String, usize>,
    last_decision: Option<ScaleDecision>,
    next_seq: u64,
}

impl ScalerState {
    fn counts(&self) -> BTreeMap<String, usize> {
        self.instances
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    fn instance_id(&mut self, kind: &str) -> String {
        self.next_seq += 1;
        format!("{kind}-scaled-{}", self.next_seq)
    }
}

pub struct Scaler {
    settings: ScalerSettings,
    source: Arc<dyn MetricsSource>,
    spawner: Arc<dyn ProcessSpawner>,
    state: Mutex<ScalerState>,
}

impl Scaler {
    pub fn new(
        settings: ScalerSettings,
        source: Arc<dyn MetricsSource>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let window = MetricWindow::new(settings.window_size);
        Self {
            settings,
            source,
            spawner,
            state: Mutex::new(ScalerState {
                window,
                instances: BTreeMap::new(),
                last_up: None,
                last_down: None,
                last_queue: BTreeMap::new(),
                last_decision: None,
                next_seq: 0,
            }),
        }
    }

    fn worker_type(&self, kind: &str) -> Result<&WorkerTypeSettings> {
        self.settings
            .worker_types
            .iter()
            .find(|w| w.kind == kind)
            .ok_or_else(|| HiveError::NotFound(format!("worker type {kind}")))
    }

    async fn spawn_one(&self, state: &mut ScalerState, kind: &str) -> Result<String> {
        let wt = self.worker_type(kind)?;
        let running = state.instances.get(kind).map_or(0, Vec::len);
        if running >= wt.max_instances as usize {
            return Err(HiveError::Capacity(format!(
                "{kind} already at {} instances",
                wt.max_instances
            )));
        }
        let id = state.instance_id(kind);
        self.spawner.spawn(wt, &id).await?;
        state
            .instances
            .entry(kind.to_string())
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    async fn stop_one(&self, state: &mut ScalerState, kind: &str) -> Result<String> {
        let wt = self.worker_type(kind)?;
        let pool = state.instances.entry(kind.to_string()).or_default();
        if pool.len() <= wt.min_instances as usize {
            return Err(HiveError::Capacity(format!(
                "{kind} already at its minimum of {}",
                wt.min_instances
            )));
        }
        // Newest first, so long-lived instances keep their warm caches.
        let Some(id) = pool.pop() else {
            return Err(HiveError::NotFound(format!("no {kind} instance")));
        };
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        if let Err(e) = self.spawner.stop(&id, grace).await {
            tracing::warn!(instance = %id, error = %e, "stop failed");
        }
        Ok(id)
    }

    async fn fill_minimums(&self, state: &mut ScalerState) -> Result<usize> {
        let mut spawned = 0;
        for wt in &self.settings.worker_types {
            while state.instances.get(&wt.kind).map_or(0, Vec::len) < wt.min_instances as usize {
                self.spawn_one(state, &wt.kind).await?;
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Spawn instances until every worker type has its minimum.
    pub async fn ensure_minimums(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let spawned = self.fill_minimums(&mut state).await?;
        if spawned > 0 {
            tracing::info!(spawned, "worker minimums satisfied");
        }
        Ok(spawned)
    }

    /// One control-loop iteration.
    pub async fn tick(&self) -> Result<ScaleDecision> {
        let obs = self.source.observe().await?;
        let mut state = self.state.lock().await;

        let exited = self.spawner.reap_exited();
        for id in &exited {
            for pool in state.instances.values_mut() {
                pool.retain(|i| i != id);
            }
        }
        if !exited.is_empty() {
            tracing::warn!(?exited, "worker instances exited");
            match self.fill_minimums(&mut state).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(respawned = n, "worker minimums restored"),
                Err(e) => tracing::warn!(error = %e, "could not restore worker minimums"),
            }
        }

        state.window.push(obs.sample);
        state.last_queue = obs.queue_by_type.clone();

        let now = Instant::now();
        let decision = decide(
            &self.settings,
            &obs,
            &state.counts(),
            state.last_up,
            state.last_down,
            now,
        );

        match &decision {
            ScaleDecision::Up(kind) => {
                let id = self.spawn_one(&mut state, kind).await?;
                state.last_up = Some(now);
                tracing::info!(kind = %kind, instance = %id, sample = ?obs.sample, "scaled up");
            }
            ScaleDecision::Down(kind) => {
                let id = self.stop_one(&mut state, kind).await?;
                state.last_down = Some(now);
                tracing::info!(kind = %kind, instance = %id, sample = ?obs.sample, "scaled down");
            }
            ScaleDecision::Hold(reason) => {
                tracing::debug!(?reason, sample = ?obs.sample, "no scaling");
            }
        }
        state.last_decision = Some(decision.clone());
        Ok(decision)
    }

    pub async fn report(&self) -> ScalerReport {
        let state = self.state.lock().await;
        let now = Instant::now();
        let remaining = |last: Option<Instant>, secs: u64| -> u64 {
            last.map(|t| {
                Duration::from_secs(secs)
                    .saturating_sub(now.saturating_duration_since(t))
                    .as_secs()
            })
            .unwrap_or(0)
        };
        ScalerReport {
            enabled: self.settings.enabled,
            samples: state.window.len(),
            averages: state.window.averages(),
            latest: state.window.latest(),
            pools: self
                .settings
                .worker_types
                .iter()
                .map(|wt| WorkerPoolReport {
                    kind: wt.kind.clone(),
                    instances: state.instances.get(&wt.kind).cloned().unwrap_or_default(),
                    min_instances: wt.min_instances,
                    max_instances: wt.max_instances,
                    queue_length: state.last_queue.get(&wt.kind).copied().unwrap_or(0),
                })
                .collect(),
            scale_up_cooldown_remaining: remaining(
                state.last_up,
                self.settings.scale_up_cooldown_secs,
            ),
            scale_down_cooldown_remaining: remaining(
                state.last_down,
                self.settings.scale_down_cooldown_secs,
            ),
            last_decision: state.last_decision.clone(),
        }
    }

    /// Stop every managed instance.
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        for (_, pool) in std::mem::take(&mut state.instances) {
            for id in pool {
                if let Err(e) = self.spawner.stop(&id, grace).await {
                    tracing::warn!(instance = %id, error = %e, "stop failed");
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        tracing::info!(interval_secs = self.settings.interval_secs, "scaler started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("scaler shutting down");
                    self.stop_all().await;
                    return;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "scaler tick failed");
                    }
                }
            }
        }
    }
}
