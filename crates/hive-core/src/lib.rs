//! hive-core: shared types, wire format, configuration and key hashing.
//! All other Hive crates depend on this one.

pub mod config;
pub mod error;
pub mod keys;
pub mod message;
pub mod presence;
pub mod task;
pub mod workflow;

pub use error::{HiveError, Result};
pub use message::{Frame, Message, MessageBody, MessagePattern, NodeId, Vote};
pub use presence::{NodeAnnouncement, NodeMetrics, PresenceEvent, PRESENCE_TOPIC};
pub use task::{CacheCall, CacheLookup, CacheOp, CacheReply, ExecuteTask, TaskOutcome, TaskPayload, TaskPriority};
pub use workflow::{PhaseTemplate, WorkflowTemplate};
