//! Resource-Manager Interface
//!
//! Typed boundary between the scheduler core and the resource manager. RPC
//! transport, ingestion and dispatch live outside this crate; here are the
//! message shapes, the callback handler contract and the scheduler event
//! envelope consumed by the event loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::resources::Resource;
use crate::{ApplicationId, NodeId};

fn default_partition() -> String {
    "default".to_string()
}

/// Resource-manager registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub rm_id: String,
    pub policy_group: String,
    pub version: String,
}

/// Identity assigned to a resource manager on registration.
#[derive(Debug, Clone)]
pub struct RmIdentity {
    pub rm_id: String,
    pub policy_group: String,
    pub version: String,
    /// Token distinguishing re-registrations of the same manager.
    pub instance: Uuid,
}

impl RmIdentity {
    pub fn assign(request: &RegisterRequest) -> Self {
        RmIdentity {
            rm_id: request.rm_id.clone(),
            policy_group: request.policy_group.clone(),
            version: request.version.clone(),
            instance: Uuid::new_v4(),
        }
    }
}

/// A new application to place into a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    pub application_id: ApplicationId,
    pub queue: String,
    #[serde(default = "default_partition")]
    pub partition: String,
}

/// A node offering schedulable capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub node_id: NodeId,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub schedulable_resource: Resource,
}

/// An allocation ask: `max_allocations` identical placements of
/// `resource_ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationAskRequest {
    pub allocation_key: String,
    pub application_id: ApplicationId,
    #[serde(default = "default_partition")]
    pub partition: String,
    pub resource_ask: Resource,
    pub max_allocations: u32,
}

/// Release of outstanding demand: one ask by key, or the whole application
/// when no key is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRelease {
    #[serde(default = "default_partition")]
    pub partition: String,
    pub application_id: ApplicationId,
    #[serde(default)]
    pub allocation_key: Option<String>,
}

/// One batch of updates from the resource manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub new_applications: Vec<NewApplication>,
    #[serde(default)]
    pub new_schedulable_nodes: Vec<NewNode>,
    #[serde(default)]
    pub asks: Vec<AllocationAskRequest>,
    #[serde(default)]
    pub releases: Vec<AllocationRelease>,
}

impl UpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.new_applications.is_empty()
            && self.new_schedulable_nodes.is_empty()
            && self.asks.is_empty()
            && self.releases.is_empty()
    }
}

/// A confirmed placement reported back to the resource manager.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub uuid: Uuid,
    pub allocation_key: String,
    pub application_id: ApplicationId,
    pub queue_path: String,
    pub node_id: NodeId,
    pub partition: String,
    pub resource: Resource,
}

/// An item the scheduler refused, with the reason for the refusal.
#[derive(Debug, Clone)]
pub struct RejectedItem {
    pub id: String,
    pub reason: String,
}

/// Callback surface through which scheduling results reach the resource
/// manager. Implementations must be cheap; they are awaited from the
/// scheduling loop.
#[async_trait]
pub trait ResourceManagerCallback: Send + Sync {
    async fn on_applications(&self, accepted: Vec<ApplicationId>, rejected: Vec<RejectedItem>);
    async fn on_nodes(&self, accepted: Vec<NodeId>, rejected: Vec<RejectedItem>);
    async fn on_new_allocations(&self, allocations: Vec<Allocation>);
}

/// Envelope posted into the scheduler's bounded work queue. Entries may
/// carry a deadline; expired entries are dropped before processing.
#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub update: UpdateRequest,
    pub deadline: Option<DateTime<Utc>>,
}

impl SchedulerEvent {
    pub fn new(update: UpdateRequest) -> Self {
        SchedulerEvent {
            update,
            deadline: None,
        }
    }

    pub fn with_deadline(update: UpdateRequest, deadline: DateTime<Utc>) -> Self {
        SchedulerEvent {
            update,
            deadline: Some(deadline),
        }
    }

    /// True when the deadline has passed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|deadline| deadline < now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_update_request_from_yaml() {
        let document = r#"
new_applications:
  - application_id: app-1
    queue: root.a
asks:
  - allocation_key: alloc-1
    application_id: app-1
    resource_ask:
      memory: 10
      vcore: 1
    max_allocations: 5
"#;
        let update: UpdateRequest = serde_yaml::from_str(document).unwrap();
        assert_eq!(update.new_applications.len(), 1);
        assert_eq!(update.new_applications[0].partition, "default");
        let ask = &update.asks[0];
        assert_eq!(ask.resource_ask.get("memory"), 10);
        assert_eq!(ask.max_allocations, 5);
        assert!(!update.is_empty());
        assert!(UpdateRequest::default().is_empty());
    }

    #[test]
    fn test_event_deadline() {
        let now = Utc::now();
        let event = SchedulerEvent::new(UpdateRequest::default());
        assert!(!event.expired(now));

        let stale =
            SchedulerEvent::with_deadline(UpdateRequest::default(), now - Duration::seconds(1));
        assert!(stale.expired(now));

        let fresh =
            SchedulerEvent::with_deadline(UpdateRequest::default(), now + Duration::seconds(60));
        assert!(!fresh.expired(now));
    }

    #[test]
    fn test_identity_assignment() {
        let request = RegisterRequest {
            rm_id: "rm:123".to_string(),
            policy_group: "policygroup".to_string(),
            version: "0.0.2".to_string(),
        };
        let first = RmIdentity::assign(&request);
        let second = RmIdentity::assign(&request);
        assert_eq!(first.rm_id, "rm:123");
        // each registration gets its own instance token
        assert_ne!(first.instance, second.instance);
    }
}
