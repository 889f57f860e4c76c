//! Task payload schema exchanged with worker nodes and the API layer.
//!
//! Payloads are opaque to the substrate: `params` and `result` are arbitrary
//! JSON supplied by the caller or produced by a worker.

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// Request payload `type` for task dispatch.
pub const EXECUTE_TASK: &str = "execute-task";
/// Request payload `type` for calls on the shared result cache.
pub const CACHE_CALL: &str = "cache";

/// Queue a task waits in on its worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// `{id, type, params, agentId?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Whether a worker may serve this task from the result cache.
    #[serde(default = "default_true")]
    pub cacheable: bool,
}

fn default_true() -> bool {
    true
}

/// `{success, result?, error?, executedAt}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp in milliseconds.
    pub executed_at: u64,
}

impl TaskOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            executed_at: crate::message::now_ms(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            executed_at: crate::message::now_ms(),
        }
    }
}

/// Request payload for task dispatch: `{type: "execute-task", task}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTask {
    #[serde(rename = "type")]
    pub kind: String,
    pub task: TaskPayload,
}

impl ExecuteTask {
    pub fn new(task: TaskPayload) -> Self {
        Self {
            kind: EXECUTE_TASK.to_string(),
            task,
        }
    }

    /// Parse a request payload, rejecting anything that is not a task dispatch.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        expect_request_type(payload, EXECUTE_TASK)?;
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// The `type` field every request payload carries.
pub fn request_type(payload: &serde_json::Value) -> Result<&str> {
    payload
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HiveError::Validation("request payload missing \"type\"".into()))
}

fn expect_request_type(payload: &serde_json::Value, expected: &str) -> Result<()> {
    let kind = request_type(payload)?;
    if kind != expected {
        return Err(HiveError::Validation(format!(
            "unsupported request type {kind:?}"
        )));
    }
    Ok(())
}

// ── Shared result cache calls ─────────────────────────────────────────────────

/// What a cache entry is keyed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLookup {
    pub task_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl From<&TaskPayload> for CacheLookup {
    fn from(task: &TaskPayload) -> Self {
        Self {
            task_type: task.task_type.clone(),
            params: task.params.clone(),
            agent_id: task.agent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CacheOp {
    Get { lookup: CacheLookup },
    Set {
        lookup: CacheLookup,
        value: serde_json::Value,
    },
}

/// Request payload for the node that owns the result cache:
/// `{type: "cache", call: {op: "get" | "set", lookup, value?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheCall {
    #[serde(rename = "type")]
    pub kind: String,
    pub call: CacheOp,
}

impl CacheCall {
    pub fn new(call: CacheOp) -> Self {
        Self {
            kind: CACHE_CALL.to_string(),
            call,
        }
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        expect_request_type(payload, CACHE_CALL)?;
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Reply to a [`CacheCall`]. `value` answers a get, `stored` a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub stored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
