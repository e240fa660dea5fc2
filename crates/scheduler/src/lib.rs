//! Hierarchical Multi-Tenant Resource Scheduler Core
//!
//! This crate implements the scheduling queue hierarchy and the preemption
//! engine of a cluster resource scheduler. Applications submit resource asks
//! into leaf queues of a per-partition queue tree; the scheduler matches the
//! demand against node capacity and, when higher-priority queues are starved,
//! reclaims resources from over-served queues via DRF-based preemption.
//!
//! Architecture:
//! - Sparse multi-dimensional resource algebra shared by all layers
//! - Arena-backed queue tree with hierarchical pending/allocating counters
//! - Lifecycle state machine for managed and dynamic queues
//! - Single-step allocation pass with pluggable queue/app sort policies
//! - Single-step preemption over a pass-owned snapshot of the tree
//! - Typed resource-manager interface consumed by a bounded event loop
//!
//! The core runs on a single scheduling task per process; the queue tree and
//! the preemption snapshot carry no internal locks.

pub mod application;
pub mod cache;
pub mod config;
pub mod context;
pub mod preemption;
pub mod queue;
pub mod resources;
pub mod rminterface;
pub mod scheduler;
pub mod sorters;

pub use application::{AllocationAsk, SchedulingApp};
pub use cache::{QueueEvent, QueueInfo, QueueKind, QueueRole, QueueState};
pub use config::{PartitionConfig, QueueConfig, SchedulerConfig};
pub use context::{ClusterSchedulingContext, NodeInfo, PartitionContext};
pub use preemption::{DrfPreemptionPolicy, PreemptionContext, PreemptionPolicy};
pub use queue::{QueueId, QueueTree};
pub use resources::Resource;
pub use rminterface::{
    Allocation, AllocationAskRequest, AllocationRelease, NewApplication, NewNode, RegisterRequest,
    RejectedItem, ResourceManagerCallback, RmIdentity, SchedulerEvent, UpdateRequest,
};
pub use scheduler::{AllocationProposal, FirstFitSelector, NodeSelector, Scheduler};
pub use sorters::SortPolicyRegistry;

/// Application identifier as supplied by the resource manager.
pub type ApplicationId = String;

/// Node identifier as supplied by the resource manager.
pub type NodeId = String;

/// Error types surfaced by the scheduler core.
///
/// Configuration errors are fatal for the batch that introduced them; state,
/// capacity and not-found errors reject only the offending operation and
/// leave all counters unchanged.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue {queue} cannot handle {event} in state {state}")]
    State {
        queue: String,
        state: String,
        event: String,
    },

    #[error("capacity exceeded on queue {queue}: requested {requested}, limit {limit}")]
    Capacity {
        queue: String,
        requested: String,
        limit: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl SchedulerError {
    /// Shorthand for the not-found case, used all over the lookup paths.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            kind,
            id: id.into(),
        }
    }
}
