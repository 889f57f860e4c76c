//! hive-services: the coordination substrate: message bus over a broker,
//! node registry, coordinator, scaler and result cache.

pub mod broker;
pub mod bus;
pub mod cache;
pub mod coordinator;
pub mod events;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod resilience;
pub mod scaler;
pub mod task_store;
pub mod tcp;
pub mod worker;

pub use broker::{LocalBroker, LocalTransport, Router, Transport};
pub use bus::{Incoming, Inbox, MessageBus, ProposalOutcome, StaticMembership, Subscription};
pub use cache::{CacheStats, DistributedCache, MemoryBackend, RemoteCache, ResultCache, SetOutcome};
pub use coordinator::{Coordinator, HiveStatus, Workflow, WorkflowStatus};
pub use events::{EventHub, HiveEvent};
pub use metrics::{HiveMetrics, MetricsSource};
pub use process::{CommandSpawner, ProcessSpawner};
pub use registry::{Node, NodeRegistry, NodeStatus};
pub use resilience::{CircuitBreaker, RetryPolicy};
pub use scaler::{ScaleDecision, Scaler, ScalerReport};
pub use task_store::{Task, TaskStatus, TaskStore};
pub use tcp::{BrokerServer, TcpTransport};
pub use worker::{Operation, PriorityGate, Worker};
