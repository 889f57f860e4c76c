//! Configuration system for Hive.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HIVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hive/config.toml
//!   3. ~/.config/hive/config.toml

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HiveError;
use crate::workflow::{default_templates, WorkflowTemplate};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub node: NodeConfig,
    pub broker: BrokerConfig,
    pub bus: BusSettings,
    pub registry: RegistrySettings,
    pub coordinator: CoordinatorSettings,
    pub scaler: ScalerSettings,
    pub cache: CacheSettings,
    pub resilience: ResilienceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node id on the bus.
    pub id: String,
    /// Worker type. "coordinator" for the coordinator process.
    pub kind: String,
    /// Task types this node can execute. Empty = just `kind`.
    pub capabilities: Vec<String>,
    /// HTTP API port (coordinator only).
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Where nodes connect, e.g. "tcp://127.0.0.1:7700".
    pub url: String,
    /// Bind address for the broker role.
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub request_timeout_ms: u64,
    pub proposal_timeout_ms: u64,
    /// Delay a worker takes before casting a vote. 0 = vote immediately.
    pub deliberation_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub heartbeat_interval_ms: u64,
    /// A node with no heartbeat for this long is reported offline.
    pub staleness_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub dispatch_timeout_ms: u64,
    /// Node ids that must be online before activation. Empty = every node
    /// the configured templates target.
    pub expected_agents: Vec<String>,
    pub wait_for_agents_secs: u64,
    /// How often running tasks are checked against the registry.
    pub discovery_interval_ms: u64,
    /// Finished workflows kept, with their tasks, for status queries. The
    /// oldest are dropped first.
    pub max_finished_workflows: usize,
    pub max_dead_letters: usize,
    pub workflows: Vec<WorkflowTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub queue_depth: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTypeSettings {
    pub kind: String,
    /// Executable used to start an instance.
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub min_instances: u32,
    pub max_instances: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Any exceeded → scale up.
    pub scale_up: Thresholds,
    /// All under → scale down.
    pub scale_down: Thresholds,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    /// SIGTERM → SIGKILL grace period.
    pub shutdown_grace_secs: u64,
    /// Samples kept per metric for reporting.
    pub window_size: usize,
    pub worker_types: Vec<WorkerTypeSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStrategy {
    pub ttl_secs: u64,
    pub compress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Node that holds the entries. Every other node reaches the cache
    /// through requests to this one.
    pub owner: String,
    /// How long a worker waits on the owner before treating a lookup as a
    /// miss.
    pub remote_timeout_ms: u64,
    pub key_prefix: String,
    pub default_ttl_secs: u64,
    pub default_compress: bool,
    /// Serialized values above this size are compression candidates.
    pub compression_threshold_bytes: usize,
    /// Hard cap on the stored size of one entry.
    pub max_entry_bytes: usize,
    /// Expired-entry sweep period. 0 = lazy expiry only.
    pub sweep_interval_secs: u64,
    /// Per-task-type overrides of TTL and compression.
    pub strategies: BTreeMap<String, CacheStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 0 = retry forever.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failure fraction over the window that opens the breaker.
    pub error_rate_threshold: f64,
    /// Calls in the window before the rate is trusted.
    pub min_requests: usize,
    pub window_size: usize,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Backoff between template-declared task retries.
    pub retry: RetrySettings,
    /// Broker reconnection backoff.
    pub reconnect: RetrySettings,
    /// Breaker around worker operations.
    pub breaker: BreakerSettings,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "coordinator".to_string(),
            kind: "coordinator".to_string(),
            capabilities: Vec::new(),
            api_port: 9001,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:7700".to_string(),
            listen: "127.0.0.1:7700".to_string(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            proposal_timeout_ms: 10_000,
            deliberation_ms: 100,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            staleness_window_ms: 30_000,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 60_000,
            expected_agents: Vec::new(),
            wait_for_agents_secs: 30,
            discovery_interval_ms: 1_000,
            max_finished_workflows: 1_000,
            max_dead_letters: 1_000,
            workflows: default_templates(),
        }
    }
}

impl Thresholds {
    pub fn scale_up() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            queue_depth: 50.0,
            latency_ms: 5_000.0,
        }
    }

    pub fn scale_down() -> Self {
        Self {
            cpu_percent: 40.0,
            memory_percent: 42.5,
            queue_depth: 15.0,
            latency_ms: 2_500.0,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::scale_up()
    }
}

impl Default for WorkerTypeSettings {
    fn default() -> Self {
        Self {
            kind: String::new(),
            command: "hived".to_string(),
            args: vec!["worker".to_string()],
            env: BTreeMap::new(),
            min_instances: 1,
            max_instances: 3,
        }
    }
}

impl Default for ScalerSettings {
    fn default() -> Self {
        let worker_types = ["research", "code", "data", "qa"]
            .into_iter()
            .map(|kind| WorkerTypeSettings {
                kind: kind.to_string(),
                ..WorkerTypeSettings::default()
            })
            .collect();
        Self {
            enabled: false,
            interval_secs: 30,
            scale_up: Thresholds::scale_up(),
            scale_down: Thresholds::scale_down(),
            scale_up_cooldown_secs: 60,
            scale_down_cooldown_secs: 300,
            shutdown_grace_secs: 10,
            window_size: 10,
            worker_types,
        }
    }
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            compress: true,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        let mut strategies = BTreeMap::new();
        strategies.insert(
            "research".to_string(),
            CacheStrategy {
                ttl_secs: 7_200,
                compress: true,
            },
        );
        strategies.insert(
            "testing".to_string(),
            CacheStrategy {
                ttl_secs: 600,
                compress: false,
            },
        );
        Self {
            owner: "coordinator".to_string(),
            remote_timeout_ms: 2_000,
            key_prefix: "hive:cache:".to_string(),
            default_ttl_secs: 3_600,
            default_compress: true,
            compression_threshold_bytes: 1_024,
            max_entry_bytes: 1_048_576, // 1 MB
            sweep_interval_secs: 60,
            strategies,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.5,
            min_requests: 5,
            window_size: 20,
            reset_timeout_ms: 30_000,
        }
    }
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            reconnect: RetrySettings {
                max_attempts: 0,
                initial_backoff_ms: 500,
                backoff_factor: 2.0,
                max_backoff_ms: 30_000,
            },
            breaker: BreakerSettings::default(),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl BusSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
    pub fn deliberation(&self) -> Duration {
        Duration::from_millis(self.deliberation_ms)
    }
}

impl RegistrySettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }
}

impl CoordinatorSettings {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Explicit expected agents, or every node the templates target.
    pub fn resolved_expected_agents(&self) -> Vec<String> {
        if !self.expected_agents.is_empty() {
            return self.expected_agents.clone();
        }
        let mut out: Vec<String> = Vec::new();
        for node in self.workflows.iter().flat_map(|w| w.target_nodes()) {
            if !out.contains(&node) {
                out.push(node);
            }
        }
        out
    }
}

impl CacheSettings {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Strategy for a task type, falling back to the global default.
    pub fn strategy_for(&self, task_type: &str) -> CacheStrategy {
        self.strategies
            .get(task_type)
            .copied()
            .unwrap_or(CacheStrategy {
                ttl_secs: self.default_ttl_secs,
                compress: self.default_compress,
            })
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hive")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for HiveError {
    fn from(e: ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HiveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HiveConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HiveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::Invalid("node.id is empty".into()));
        }
        if self.registry.heartbeat_interval_ms >= self.registry.staleness_window_ms {
            return Err(ConfigError::Invalid(
                "registry.heartbeat_interval_ms must be below staleness_window_ms".into(),
            ));
        }
        for template in &self.coordinator.workflows {
            template
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        for wt in &self.scaler.worker_types {
            if wt.kind.is_empty() {
                return Err(ConfigError::Invalid("scaler worker type without kind".into()));
            }
            if wt.max_instances == 0 || wt.min_instances > wt.max_instances {
                return Err(ConfigError::Invalid(format!(
                    "worker type {:?}: need 0 < max_instances and min <= max",
                    wt.kind
                )));
            }
        }
        if self.cache.owner.trim().is_empty() {
            return Err(ConfigError::Invalid("cache.owner is empty".into()));
        }
        if self.scaler.window_size == 0 {
            return Err(ConfigError::Invalid("scaler.window_size must be positive".into()));
        }
        Ok(())
    }

    /// Apply HIVE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HIVE_NODE__ID") {
            self.node.id = v;
        }
        if let Ok(v) = std::env::var("HIVE_NODE__KIND") {
            self.node.kind = v;
        }
        if let Ok(v) = std::env::var("HIVE_NODE__CAPABILITIES") {
            self.node.capabilities = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("HIVE_NODE__API_PORT") {
            if let Ok(p) = v.parse() {
                self.node.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("HIVE_BROKER__URL") {
            self.broker.url = v;
        }
        if let Ok(v) = std::env::var("HIVE_BROKER__LISTEN") {
            self.broker.listen = v;
        }
        if let Ok(v) = std::env::var("HIVE_SCALER__ENABLED") {
            self.scaler.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("HIVE_CACHE__OWNER") {
            self.cache.owner = v;
        }
        if let Ok(v) = std::env::var("HIVE_CACHE__DEFAULT_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.cache.default_ttl_secs = ttl;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HiveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bus.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.coordinator.dispatch_timeout(), Duration::from_secs(60));
        assert_eq!(config.registry.staleness_window(), Duration::from_secs(30));
        assert!(!config.scaler.enabled);
        assert_eq!(config.cache.owner, config.node.id);
        assert_eq!(config.cache.remote_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn scale_down_thresholds_are_half_except_queue() {
        let s = ScalerSettings::default();
        assert_eq!(s.scale_down.cpu_percent, s.scale_up.cpu_percent / 2.0);
        assert_eq!(s.scale_down.memory_percent, s.scale_up.memory_percent / 2.0);
        assert_eq!(s.scale_down.queue_depth, s.scale_up.queue_depth * 0.3);
    }

    #[test]
    fn strategy_falls_back_to_default() {
        let cache = CacheSettings::default();
        assert_eq!(cache.strategy_for("testing").ttl_secs, 600);
        let fallback = cache.strategy_for("unknown-type");
        assert_eq!(fallback.ttl_secs, cache.default_ttl_secs);
        assert_eq!(fallback.compress, cache.default_compress);
    }

    #[test]
    fn expected_agents_derive_from_templates() {
        let c = CoordinatorSettings::default();
        assert_eq!(
            c.resolved_expected_agents(),
            vec!["research-1", "code-1", "data-1", "qa-1"]
        );
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut config = HiveConfig::default();
        config.scaler.worker_types[0].min_instances = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let text = r#"
            [node]
            id = "worker-9"
            kind = "research"

            [cache.strategies.keyword-discovery]
            ttl_secs = 120
            compress = false
        "#;
        let config: HiveConfig = toml::from_str(text).unwrap();
        assert_eq!(config.node.id, "worker-9");
        assert_eq!(config.node.api_port, 9001);
        assert_eq!(config.cache.strategy_for("keyword-discovery").ttl_secs, 120);
        assert_eq!(config.bus.request_timeout_ms, 30_000);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("hive-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("HIVE_CONFIG", config_path.to_str().unwrap());
        }

        let path = HiveConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = HiveConfig::load().expect("load should succeed");
        assert_eq!(config.coordinator.workflows.len(), default_templates().len());

        unsafe {
            std::env::remove_var("HIVE_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
