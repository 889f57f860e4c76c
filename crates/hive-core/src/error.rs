//! Error taxonomy shared by every Hive crate.
//!
//! Variants carry owned strings only, so an error can be cloned onto a task
//! record or sent across a channel without losing its kind.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HiveError {
    /// Broker unreachable or the connection dropped mid-send.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response or acknowledgment within the protocol window.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// The target explicitly reported failure.
    #[error("task failed: {0}")]
    TaskFailure(String),

    /// Malformed message, task or workflow definition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cache entry too large, or a worker pool at its instance bound.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HiveError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Stable name of the error kind, used in HTTP bodies and task records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TransportError",
            Self::Timeout { .. } => "Timeout",
            Self::TaskFailure(_) => "TaskFailure",
            Self::Validation(_) => "ValidationError",
            Self::Capacity(_) => "CapacityError",
            Self::NotFound(_) => "NotFound",
            Self::Config(_) => "ConfigError",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
