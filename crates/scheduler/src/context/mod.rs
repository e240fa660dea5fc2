//! Cluster Scheduling Context
//!
//! Process-wide scheduling state: one `PartitionContext` per partition, each
//! owning its queue tree, its registered nodes and the application-to-queue
//! index. The context is confined behind an explicit handle owned by the
//! scheduler; nothing here is global.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::application::{AllocationAsk, SchedulingApp};
use crate::cache::{QueueInfo, QueueRole};
use crate::config::{PartitionConfig, QueueConfig, SchedulerConfig};
use crate::queue::{QueueId, QueueTree};
use crate::resources::Resource;
use crate::{ApplicationId, NodeId, SchedulerError};

/// Root queue property keys selecting the partition's sort policies.
const QUEUE_SORT_POLICY_KEY: &str = "queue.sort.policy";
const APP_SORT_POLICY_KEY: &str = "application.sort.policy";

/// A schedulable node as reported by the resource manager.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node_id: NodeId,
    attributes: HashMap<String, String>,
    total: Resource,
    occupied: Resource,
}

impl NodeInfo {
    pub fn new(
        node_id: impl Into<String>,
        attributes: HashMap<String, String>,
        total: Resource,
    ) -> Self {
        NodeInfo {
            node_id: node_id.into(),
            attributes,
            total,
            occupied: Resource::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn total(&self) -> &Resource {
        &self.total
    }

    pub fn occupied(&self) -> &Resource {
        &self.occupied
    }

    /// Capacity still free on this node.
    pub fn available(&self) -> Resource {
        self.total.sub(&self.occupied)
    }

    /// True when the ask fits into the free capacity.
    pub fn can_fit(&self, ask: &Resource) -> bool {
        ask.fits_in(&self.available())
    }

    pub(crate) fn occupy(&mut self, delta: &Resource) {
        self.occupied.add_assign(delta);
    }

    pub(crate) fn release(&mut self, delta: &Resource) {
        self.occupied.sub_assign_saturating(delta);
    }
}

/// Per-partition scheduling state: queue tree, nodes and applications.
#[derive(Debug)]
pub struct PartitionContext {
    name: String,
    tree: QueueTree,
    nodes: HashMap<NodeId, NodeInfo>,
    total_capacity: Resource,
    applications: HashMap<ApplicationId, QueueId>,
    queue_sort_policy: String,
    app_sort_policy: String,
    next_app_seq: u64,
}

impl PartitionContext {
    /// Build a partition from its validated configuration.
    pub fn from_config(config: &PartitionConfig) -> Result<Self, SchedulerError> {
        if config.queues.len() != 1 {
            return Err(SchedulerError::Config(format!(
                "partition '{}' must declare exactly one root queue",
                config.name
            )));
        }
        let root_config = &config.queues[0];
        let root_info = QueueInfo::managed(
            root_config.name.clone(),
            root_config.name.clone(),
            QueueRole::Parent,
            root_config.guaranteed_resource()?,
            root_config.max_resource()?,
            root_config.properties.clone(),
        );
        let queue_sort_policy = root_config
            .properties
            .get(QUEUE_SORT_POLICY_KEY)
            .cloned()
            .unwrap_or_else(|| "fair".to_string());
        let app_sort_policy = root_config
            .properties
            .get(APP_SORT_POLICY_KEY)
            .cloned()
            .unwrap_or_else(|| "fifo".to_string());

        let mut tree = QueueTree::new(root_info)?;
        let root = tree.root();
        for child in &root_config.queues {
            add_managed_queue(&mut tree, root, child, &root_config.name)?;
        }
        Ok(PartitionContext {
            name: config.name.clone(),
            tree,
            nodes: HashMap::new(),
            total_capacity: Resource::new(),
            applications: HashMap::new(),
            queue_sort_policy,
            app_sort_policy,
            next_app_seq: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &QueueTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut QueueTree {
        &mut self.tree
    }

    pub fn queue_sort_policy(&self) -> &str {
        &self.queue_sort_policy
    }

    pub fn app_sort_policy(&self) -> &str {
        &self.app_sort_policy
    }

    // ---- nodes -----------------------------------------------------------

    /// Register a node, growing the partition's total capacity.
    pub fn add_node(&mut self, node: NodeInfo) -> Result<(), SchedulerError> {
        if self.nodes.contains_key(node.node_id()) {
            return Err(SchedulerError::Config(format!(
                "node '{}' already registered in partition '{}'",
                node.node_id(),
                self.name
            )));
        }
        info!(partition = %self.name, node = %node.node_id(), capacity = %node.total(), "node registered");
        self.total_capacity.add_assign(node.total());
        self.nodes.insert(node.node_id().to_string(), node);
        Ok(())
    }

    /// Drop a node, shrinking the total capacity.
    pub fn remove_node(&mut self, node_id: &str) -> Option<NodeInfo> {
        let node = self.nodes.remove(node_id)?;
        self.total_capacity.sub_assign_saturating(node.total());
        Some(node)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    pub(crate) fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(node_id)
    }

    /// Nodes in id order, for deterministic selection.
    pub fn sorted_nodes(&self) -> Vec<&NodeInfo> {
        let mut nodes: Vec<&NodeInfo> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        nodes
    }

    /// Sum of schedulable resources over all registered nodes.
    pub fn total_capacity(&self) -> &Resource {
        &self.total_capacity
    }

    // ---- applications ----------------------------------------------------

    /// Place an application into a leaf queue by path.
    ///
    /// An unknown final path segment under a running parent creates a
    /// dynamic leaf; anything else missing is an error. Submissions into
    /// queues that are not running are rejected.
    pub fn add_application(
        &mut self,
        application_id: &str,
        queue_path: &str,
    ) -> Result<QueueId, SchedulerError> {
        if self.applications.contains_key(application_id) {
            return Err(SchedulerError::Config(format!(
                "application '{application_id}' already exists in partition '{}'",
                self.name
            )));
        }
        let leaf = match self.tree.queue_by_path(queue_path) {
            Some(id) => id,
            None => self.create_dynamic_leaf(queue_path)?,
        };
        let node = self
            .tree
            .queue(leaf)
            .ok_or_else(|| SchedulerError::not_found("queue", queue_path))?;
        if !node.info().is_leaf() {
            return Err(SchedulerError::Config(format!(
                "cannot submit application '{application_id}' to parent queue '{queue_path}'"
            )));
        }
        if !node.info().is_running() {
            return Err(SchedulerError::State {
                queue: queue_path.to_string(),
                state: node.info().state().to_string(),
                event: "submit application".to_string(),
            });
        }
        let seq = self.next_app_seq;
        self.next_app_seq += 1;
        self.tree
            .add_application(leaf, SchedulingApp::new(application_id, leaf, seq))?;
        self.applications.insert(application_id.to_string(), leaf);
        debug!(partition = %self.name, application = %application_id, queue = %queue_path, "application added");
        Ok(leaf)
    }

    fn create_dynamic_leaf(&mut self, queue_path: &str) -> Result<QueueId, SchedulerError> {
        let (parent_path, name) = queue_path
            .rsplit_once('.')
            .ok_or_else(|| SchedulerError::not_found("queue", queue_path))?;
        let parent = self
            .tree
            .queue_by_path(parent_path)
            .ok_or_else(|| SchedulerError::not_found("queue", parent_path))?;
        let parent_node = self
            .tree
            .queue(parent)
            .ok_or_else(|| SchedulerError::not_found("queue", parent_path))?;
        if parent_node.info().is_leaf() || !parent_node.info().is_running() {
            return Err(SchedulerError::Config(format!(
                "cannot create dynamic queue '{queue_path}' under '{parent_path}'"
            )));
        }
        let info = QueueInfo::dynamic(name, queue_path, QueueRole::Leaf);
        let id = self.tree.add_queue(parent, info)?;
        info!(partition = %self.name, queue = %queue_path, "dynamic queue created");
        Ok(id)
    }

    /// Remove an application, correcting pending and cleaning up empty
    /// dynamic or draining queues along the path.
    pub fn remove_application(
        &mut self,
        application_id: &str,
    ) -> Result<SchedulingApp, SchedulerError> {
        let leaf = self
            .applications
            .remove(application_id)
            .ok_or_else(|| SchedulerError::not_found("application", application_id))?;
        let app = self
            .tree
            .remove_application(leaf, application_id)
            .ok_or_else(|| SchedulerError::not_found("application", application_id))?;
        // auto-removal: dynamic queues go as soon as they are empty, managed
        // ones only when draining; remove_queue enforces both
        let mut current = Some(leaf);
        while let Some(queue) = current {
            let parent = self.tree.queue(queue).and_then(|node| node.parent());
            if !self.tree.remove_queue(queue) {
                break;
            }
            current = parent;
        }
        Ok(app)
    }

    /// Leaf queue holding an application.
    pub fn application_queue(&self, application_id: &str) -> Option<QueueId> {
        self.applications.get(application_id).copied()
    }

    /// Route an ask to its application's leaf and propagate pending.
    pub fn add_ask(&mut self, ask: AllocationAsk) -> Result<(), SchedulerError> {
        let leaf = self
            .application_queue(&ask.application_id)
            .ok_or_else(|| SchedulerError::not_found("application", ask.application_id.clone()))?;
        self.tree.add_ask(leaf, ask)
    }

    /// True when some leaf has demand and sits below its guaranteed share.
    pub fn need_preemption(&self) -> bool {
        self.tree.leaf_ids().into_iter().any(|leaf| {
            let node = match self.tree.queue(leaf) {
                Some(node) => node,
                None => return false,
            };
            if node.pending().is_zero() {
                return false;
            }
            match node.info().guaranteed() {
                Some(guaranteed) => node.assumed_allocated().below_anywhere(guaranteed),
                None => false,
            }
        })
    }
}

fn add_managed_queue(
    tree: &mut QueueTree,
    parent: QueueId,
    config: &QueueConfig,
    parent_path: &str,
) -> Result<(), SchedulerError> {
    let path = format!("{}.{}", parent_path, config.name);
    let role = if config.is_parent() {
        QueueRole::Parent
    } else {
        QueueRole::Leaf
    };
    let info = QueueInfo::managed(
        config.name.clone(),
        path.clone(),
        role,
        config.guaranteed_resource()?,
        config.max_resource()?,
        config.properties.clone(),
    );
    let id = tree.add_queue(parent, info)?;
    for child in &config.queues {
        add_managed_queue(tree, id, child, &path)?;
    }
    Ok(())
}

/// All partitions of the cluster, keyed by name.
#[derive(Debug)]
pub struct ClusterSchedulingContext {
    partitions: HashMap<String, PartitionContext>,
}

impl ClusterSchedulingContext {
    /// Build every partition from a validated configuration document.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let mut partitions = HashMap::new();
        for partition_config in &config.partitions {
            let partition = PartitionContext::from_config(partition_config)?;
            partitions.insert(partition_config.name.clone(), partition);
        }
        Ok(ClusterSchedulingContext { partitions })
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionContext> {
        self.partitions.get(name)
    }

    pub fn partition_mut(&mut self, name: &str) -> Option<&mut PartitionContext> {
        self.partitions.get_mut(name)
    }

    /// Partition names in deterministic order.
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// True when any partition reports a starved leaf with demand. The
    /// check is conservative; a false positive only costs a cheap pass.
    pub fn need_preemption(&self) -> bool {
        self.partitions.values().any(PartitionContext::need_preemption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueueEvent;
    use crate::config;

    const CONFIG: &str = r#"
partitions:
  - name: default
    queues:
      - name: root
        submitacl: "*"
        queues:
          - name: a
            resources:
              guaranteed:
                memory: 100
          - name: dynparent
            parent: true
"#;

    fn cluster() -> ClusterSchedulingContext {
        let config = config::parse(CONFIG).unwrap();
        ClusterSchedulingContext::from_config(&config).unwrap()
    }

    fn res(entries: &[(&str, u64)]) -> Resource {
        Resource::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    #[test]
    fn test_build_from_config() {
        let cluster = cluster();
        assert_eq!(cluster.partition_names(), vec!["default".to_string()]);
        let partition = cluster.partition("default").unwrap();
        assert!(partition.tree().queue_by_path("root.a").is_some());
        assert!(partition.tree().queue_by_path("root.dynparent").is_some());
        assert_eq!(partition.queue_sort_policy(), "fair");
        assert_eq!(partition.app_sort_policy(), "fifo");
    }

    #[test]
    fn test_node_registration_grows_capacity() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new(
                "node-1",
                HashMap::new(),
                res(&[("memory", 100)]),
            ))
            .unwrap();
        partition
            .add_node(NodeInfo::new(
                "node-2",
                HashMap::new(),
                res(&[("memory", 50)]),
            ))
            .unwrap();
        assert_eq!(partition.total_capacity(), &res(&[("memory", 150)]));

        // duplicate registration is rejected, capacity unchanged
        let err = partition
            .add_node(NodeInfo::new(
                "node-1",
                HashMap::new(),
                res(&[("memory", 10)]),
            ))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
        assert_eq!(partition.total_capacity(), &res(&[("memory", 150)]));

        partition.remove_node("node-2");
        assert_eq!(partition.total_capacity(), &res(&[("memory", 100)]));
    }

    #[test]
    fn test_submit_to_managed_leaf() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        let leaf = partition.add_application("app-1", "root.a").unwrap();
        assert_eq!(partition.application_queue("app-1"), Some(leaf));
        // duplicate submission is rejected
        assert!(partition.add_application("app-1", "root.a").is_err());
    }

    #[test]
    fn test_dynamic_leaf_created_and_auto_removed() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        let leaf = partition
            .add_application("app-1", "root.dynparent.user1")
            .unwrap();
        let node = partition.tree().queue(leaf).unwrap();
        assert!(!node.info().is_managed());
        assert!(node.info().is_leaf());

        // removing the last app removes the empty dynamic queue without
        // passing through draining
        partition.remove_application("app-1").unwrap();
        assert!(partition.tree().queue_by_path("root.dynparent.user1").is_none());
        // the managed parent stays
        assert!(partition.tree().queue_by_path("root.dynparent").is_some());
    }

    #[test]
    fn test_submit_to_unknown_parent_fails() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        let err = partition
            .add_application("app-1", "root.nosuch.leaf")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }

    #[test]
    fn test_submit_to_stopped_queue_rejected() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        let leaf = partition.tree().queue_by_path("root.a").unwrap();
        partition
            .tree_mut()
            .handle_queue_event(leaf, QueueEvent::Stop)
            .unwrap();
        let err = partition.add_application("app-1", "root.a").unwrap_err();
        assert!(matches!(err, SchedulerError::State { .. }));
    }

    #[test]
    fn test_need_preemption_trigger() {
        let mut cluster = cluster();
        assert!(!cluster.need_preemption());
        let partition = cluster.partition_mut("default").unwrap();
        let leaf = partition.tree().queue_by_path("root.a").unwrap();
        // demand alone does not trigger: the leaf must also sit below its
        // guaranteed share -- which it does with zero usage
        partition.tree_mut().inc_pending(leaf, &res(&[("memory", 10)]));
        assert!(cluster.need_preemption());
    }

    #[test]
    fn test_ask_routing_unknown_application() {
        let mut cluster = cluster();
        let partition = cluster.partition_mut("default").unwrap();
        let err = partition
            .add_ask(AllocationAsk::new(
                "alloc-1",
                "ghost",
                res(&[("memory", 1)]),
                1,
            ))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }
}
