//! Metric sampling for the scaler and for node heartbeats.
//!
//! Host CPU and memory come straight from `/proc`. Queue depth and latency
//! come from the coordinator's task store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use hive_core::Result;

use crate::task_store::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub queue_depth: f64,
    pub avg_latency_ms: f64,
}

/// One scaler input: global metrics plus per-worker-type queue lengths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub sample: MetricSample,
    pub queue_by_type: BTreeMap<String, usize>,
}

#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    async fn observe(&self) -> Result<Observation>;
}

// ── Sliding window ────────────────────────────────────────────────────────────

/// Last N samples of each metric. Reporting only; decisions use the latest
/// sample.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    capacity: usize,
    samples: VecDeque<MetricSample>,
}

impl MetricWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<MetricSample> {
        self.samples.back().copied()
    }

    pub fn averages(&self) -> MetricSample {
        let n = self.samples.len();
        if n == 0 {
            return MetricSample::default();
        }
        let mut sum = MetricSample::default();
        for s in &self.samples {
            sum.cpu_percent += s.cpu_percent;
            sum.memory_percent += s.memory_percent;
            sum.queue_depth += s.queue_depth;
            sum.avg_latency_ms += s.avg_latency_ms;
        }
        let n = n as f64;
        MetricSample {
            cpu_percent: sum.cpu_percent / n,
            memory_percent: sum.memory_percent / n,
            queue_depth: sum.queue_depth / n,
            avg_latency_ms: sum.avg_latency_ms / n,
        }
    }
}

// ── Host metrics ──────────────────────────────────────────────────────────────

/// `(total, idle)` jiffies from the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((fields.iter().sum(), idle))
}

/// Used memory percentage from `/proc/meminfo`.
pub fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

/// CPU and memory utilisation of the local host.
#[derive(Debug, Default)]
pub struct HostMetrics {
    /// Previous `(total, idle)` reading, for CPU deltas.
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU busy percentage since the previous call (since boot on the first).
    pub fn cpu_percent(&self) -> f64 {
        let Some((total, idle)) = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| parse_cpu_line(&s))
        else {
            return 0.0;
        };
        let mut last = self.last_cpu.lock().unwrap_or_else(|p| p.into_inner());
        let (prev_total, prev_idle) = last.unwrap_or((0, 0));
        *last = Some((total, idle));
        let d_total = total.saturating_sub(prev_total);
        let d_idle = idle.saturating_sub(prev_idle);
        if d_total == 0 {
            return 0.0;
        }
        (d_total - d_idle.min(d_total)) as f64 / d_total as f64 * 100.0
    }

    pub fn memory_percent(&self) -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(0.0)
    }
}

/// Host utilisation plus the coordinator's queue.
pub struct HiveMetrics {
    host: HostMetrics,
    tasks: TaskStore,
}

impl HiveMetrics {
    pub fn new(tasks: TaskStore) -> Self {
        Self {
            host: HostMetrics::new(),
            tasks,
        }
    }
}

#[async_trait]
impl MetricsSource for HiveMetrics {
    async fn observe(&self) -> Result<Observation> {
        let queue = self.tasks.queue_view();
        Ok(Observation {
            sample: MetricSample {
                cpu_percent: self.host.cpu_percent(),
                memory_percent: self.host.memory_percent(),
                queue_depth: queue.depth as f64,
                avg_latency_ms: queue.avg_latency_ms,
            },
            queue_by_type: queue.by_worker_type,
        })
    }
}
