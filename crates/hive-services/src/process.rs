//! Worker process lifecycle: spawn, graceful stop, exit tracking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use hive_core::config::WorkerTypeSettings;
use hive_core::{HiveError, Result};

#[async_trait]
pub trait ProcessSpawner: Send + Sync + 'static {
    /// Start one instance of `worker` that joins the hive as `instance_id`.
    /// Returns the OS pid when there is one.
    async fn spawn(&self, worker: &WorkerTypeSettings, instance_id: &str) -> Result<Option<u32>>;

    /// Stop an instance: SIGTERM, wait up to `grace`, then kill.
    async fn stop(&self, instance_id: &str, grace: Duration) -> Result<()>;

    /// Instances that exited on their own since the last call.
    fn reap_exited(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Spawns worker types as child processes of the current process.
///
/// Each child gets `HIVE_NODE__ID`, `HIVE_NODE__KIND` and
/// `HIVE_BROKER__URL` so it connects to the same broker under its own id,
/// plus `HIVE_CACHE__OWNER` when a cache owner is set.
pub struct CommandSpawner {
    broker_url: String,
    cache_owner: Option<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl CommandSpawner {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            cache_owner: None,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Point spawned workers at the node holding the shared result cache.
    pub fn with_cache_owner(mut self, owner: impl Into<String>) -> Self {
        self.cache_owner = Some(owner.into());
        self
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn running(&self) -> usize {
        self.children().len()
    }
}

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, worker: &WorkerTypeSettings, instance_id: &str) -> Result<Option<u32>> {
        let mut command = Command::new(&worker.command);
        command
            .args(&worker.args)
            .envs(&worker.env)
            .env("HIVE_NODE__ID", instance_id)
            .env("HIVE_NODE__KIND", &worker.kind)
            .env("HIVE_BROKER__URL", &self.broker_url)
            .kill_on_drop(true);
        if let Some(owner) = &self.cache_owner {
            command.env("HIVE_CACHE__OWNER", owner);
        }
        let child = command
            .spawn()
            .map_err(|e| {
                HiveError::Config(format!("failed to spawn '{}': {}", worker.command, e))
            })?;
        let pid = child.id();
        tracing::info!(instance = instance_id, kind = %worker.kind, ?pid, "worker spawned");
        self.children().insert(instance_id.to_string(), child);
        Ok(pid)
    }

    async fn stop(&self, instance_id: &str, grace: Duration) -> Result<()> {
        let mut child = self
            .children()
            .remove(instance_id)
            .ok_or_else(|| HiveError::NotFound(format!("instance {instance_id}")))?;

        let Some(pid) = child.id() else {
            // Already exited and reaped.
            return Ok(());
        };

        tracing::info!(instance = instance_id, pid, "sending SIGTERM");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(instance = instance_id, pid, error = %e, "SIGTERM failed");
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(instance = instance_id, %status, "worker stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(HiveError::Transport(format!("wait on {instance_id}: {e}"))),
            Err(_) => {
                tracing::warn!(instance = instance_id, ?grace, "grace period over, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| HiveError::Transport(format!("kill {instance_id}: {e}")))
            }
        }
    }

    fn reap_exited(&self) -> Vec<String> {
        let mut children = self.children();
        let exited: Vec<String> = children
            .iter_mut()
            .filter_map(|(id, child)| match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(instance = %id, %status, "worker exited");
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        for id in &exited {
            children.remove(id);
        }
        exited
    }
}
