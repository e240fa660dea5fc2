//! Scheduler Orchestrator
//!
//! The scheduler advances in single steps on one task. Each step applies an
//! update batch from the resource manager, runs an allocation pass over
//! every partition (descending the queue tree with the configured sort
//! policies and asking the node selector to place eligible asks) and, when
//! the trigger fires, a preemption pass over a fresh snapshot. An
//! allocation step and a preemption step never interleave.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::AllocationAsk;
use crate::config;
use crate::context::{ClusterSchedulingContext, NodeInfo};
use crate::preemption::{default_policies, PreemptionContext, PreemptionPolicy};
use crate::queue::QueueId;
use crate::resources::Resource;
use crate::rminterface::{
    Allocation, AllocationAskRequest, AllocationRelease, RegisterRequest, RejectedItem,
    ResourceManagerCallback, RmIdentity, SchedulerEvent, UpdateRequest,
};
use crate::sorters::SortPolicyRegistry;
use crate::{NodeId, SchedulerError};

/// Node-selection contract: given an ask and the candidate nodes of a
/// partition, pick at most one node able to host it. Implementations must
/// be pure in-memory computation and deterministic for equal inputs.
pub trait NodeSelector: Send + Sync {
    fn select(&self, ask: &Resource, candidates: &[&NodeInfo]) -> Option<NodeId>;
}

/// Picks the first node (in id order) with enough free capacity.
pub struct FirstFitSelector;

impl NodeSelector for FirstFitSelector {
    fn select(&self, ask: &Resource, candidates: &[&NodeInfo]) -> Option<NodeId> {
        candidates
            .iter()
            .find(|node| node.can_fit(ask))
            .map(|node| node.node_id().to_string())
    }
}

/// A tentative allocation: the ask repeat has been taken, `allocating` and
/// the node's occupancy raised. Confirmation turns it into a confirmed
/// allocation; rejection rolls all of it back.
#[derive(Debug, Clone)]
pub struct AllocationProposal {
    pub uuid: Uuid,
    pub partition: String,
    pub queue: QueueId,
    pub queue_path: String,
    pub application_id: String,
    pub allocation_key: String,
    pub node_id: NodeId,
    pub resource: Resource,
}

/// The scheduler core: cluster context, preemption machinery and the
/// pluggable policy surfaces, driven by a bounded event loop.
pub struct Scheduler {
    identity: RmIdentity,
    context: ClusterSchedulingContext,
    preemption_context: Option<PreemptionContext>,
    preemption_policies: Vec<Box<dyn PreemptionPolicy>>,
    sorters: SortPolicyRegistry,
    node_selector: Box<dyn NodeSelector>,
    callback: Arc<dyn ResourceManagerCallback>,
}

impl Scheduler {
    /// Register a resource manager: parse and validate its configuration,
    /// build the partitions and assign an identity. A bad configuration
    /// fails the registration with no partial state installed.
    pub fn register(
        request: RegisterRequest,
        configuration: &str,
        callback: Arc<dyn ResourceManagerCallback>,
    ) -> Result<Self, SchedulerError> {
        let parsed = config::parse(configuration)?;
        let context = ClusterSchedulingContext::from_config(&parsed)?;
        let identity = RmIdentity::assign(&request);
        info!(
            rm_id = %identity.rm_id,
            policy_group = %identity.policy_group,
            version = %identity.version,
            "resource manager registered"
        );
        Ok(Scheduler {
            identity,
            context,
            preemption_context: None,
            preemption_policies: default_policies(),
            sorters: SortPolicyRegistry::with_defaults(),
            node_selector: Box::new(FirstFitSelector),
            callback,
        })
    }

    pub fn identity(&self) -> &RmIdentity {
        &self.identity
    }

    pub fn context(&self) -> &ClusterSchedulingContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ClusterSchedulingContext {
        &mut self.context
    }

    /// Snapshot of the most recent preemption pass, if one ran.
    pub fn preemption_context(&self) -> Option<&PreemptionContext> {
        self.preemption_context.as_ref()
    }

    pub fn set_node_selector(&mut self, selector: Box<dyn NodeSelector>) {
        self.node_selector = selector;
    }

    pub fn register_preemption_policy(&mut self, policy: Box<dyn PreemptionPolicy>) {
        self.preemption_policies.push(policy);
    }

    /// Bounded work queue feeding [`Scheduler::run`].
    pub fn event_channel(
        capacity: usize,
    ) -> (mpsc::Sender<SchedulerEvent>, mpsc::Receiver<SchedulerEvent>) {
        mpsc::channel(capacity)
    }

    /// Consume events until the channel closes. All tree mutation happens
    /// here, on the single consumer task.
    pub async fn run(mut self, mut events: mpsc::Receiver<SchedulerEvent>) {
        while let Some(event) = events.recv().await {
            self.process_event(event).await;
        }
        info!(rm_id = %self.identity.rm_id, "event channel closed, scheduler stopping");
    }

    /// Handle one event: drop it when its deadline has passed, otherwise
    /// apply the update and run a scheduling step. Returns false for
    /// dropped events.
    pub async fn process_event(&mut self, event: SchedulerEvent) -> bool {
        if event.expired(Utc::now()) {
            warn!(deadline = ?event.deadline, "dropping expired scheduler event");
            return false;
        }
        self.handle_update(event.update).await;
        self.step().await;
        true
    }

    /// One scheduling step: allocation pass, confirmation, callback
    /// delivery, then a preemption pass when the trigger fires.
    pub async fn step(&mut self) {
        let proposals = self.single_step_schedule();
        let mut allocations = Vec::new();
        for proposal in proposals {
            match self.confirm(&proposal) {
                Ok(allocation) => allocations.push(allocation),
                Err(err) => {
                    warn!(
                        allocation_key = %proposal.allocation_key,
                        application = %proposal.application_id,
                        %err,
                        "allocation confirmation failed, rolling back"
                    );
                    self.reject(&proposal);
                }
            }
        }
        if !allocations.is_empty() {
            self.callback.on_new_allocations(allocations).await;
        }
        self.single_step_preemption();
    }

    // ---- update handling -------------------------------------------------

    /// Apply one update batch. Per-item failures reject only that item and
    /// are reported through the callback.
    pub async fn handle_update(&mut self, update: UpdateRequest) {
        let mut accepted_apps = Vec::new();
        let mut rejected_apps = Vec::new();
        for app in update.new_applications {
            let result = match self.context.partition_mut(&app.partition) {
                Some(partition) => partition.add_application(&app.application_id, &app.queue),
                None => Err(SchedulerError::not_found("partition", app.partition.clone())),
            };
            match result {
                Ok(_) => accepted_apps.push(app.application_id),
                Err(err) => rejected_apps.push(RejectedItem {
                    id: app.application_id,
                    reason: err.to_string(),
                }),
            }
        }
        if !accepted_apps.is_empty() || !rejected_apps.is_empty() {
            self.callback.on_applications(accepted_apps, rejected_apps).await;
        }

        let mut accepted_nodes = Vec::new();
        let mut rejected_nodes = Vec::new();
        for node in update.new_schedulable_nodes {
            let result = match self.context.partition_mut(&node.partition) {
                Some(partition) => partition.add_node(NodeInfo::new(
                    node.node_id.clone(),
                    node.attributes,
                    node.schedulable_resource,
                )),
                None => Err(SchedulerError::not_found("partition", node.partition.clone())),
            };
            match result {
                Ok(_) => accepted_nodes.push(node.node_id),
                Err(err) => rejected_nodes.push(RejectedItem {
                    id: node.node_id,
                    reason: err.to_string(),
                }),
            }
        }
        if !accepted_nodes.is_empty() || !rejected_nodes.is_empty() {
            self.callback.on_nodes(accepted_nodes, rejected_nodes).await;
        }

        for ask in update.asks {
            if let Err(err) = self.process_ask(ask) {
                warn!(%err, "rejecting allocation ask");
            }
        }
        for release in update.releases {
            if let Err(err) = self.process_release(release) {
                warn!(%err, "release failed");
            }
        }
    }

    fn process_ask(&mut self, ask: AllocationAskRequest) -> Result<(), SchedulerError> {
        let partition = self
            .context
            .partition_mut(&ask.partition)
            .ok_or_else(|| SchedulerError::not_found("partition", ask.partition.clone()))?;
        partition.add_ask(AllocationAsk::new(
            ask.allocation_key,
            ask.application_id,
            ask.resource_ask,
            ask.max_allocations,
        ))
    }

    fn process_release(&mut self, release: AllocationRelease) -> Result<(), SchedulerError> {
        let partition = self
            .context
            .partition_mut(&release.partition)
            .ok_or_else(|| SchedulerError::not_found("partition", release.partition.clone()))?;
        match release.allocation_key {
            Some(key) => {
                let leaf = partition
                    .application_queue(&release.application_id)
                    .ok_or_else(|| {
                        SchedulerError::not_found("application", release.application_id.clone())
                    })?;
                partition
                    .tree_mut()
                    .remove_ask(leaf, &release.application_id, &key)
            }
            None => partition
                .remove_application(&release.application_id)
                .map(|_| ()),
        }
    }

    // ---- allocation pass -------------------------------------------------

    /// Descend every partition tree, sorting siblings per level and
    /// applications at the leaves, and propose allocations for every ask
    /// that fits its leaf's headroom and some node's free capacity.
    pub fn single_step_schedule(&mut self) -> Vec<AllocationProposal> {
        let mut proposals = Vec::new();
        for name in self.context.partition_names() {
            self.schedule_partition(&name, &mut proposals);
        }
        proposals
    }

    fn schedule_partition(&mut self, name: &str, proposals: &mut Vec<AllocationProposal>) {
        let (queue_policy, app_policy) = match self.context.partition(name) {
            Some(partition) => (
                partition.queue_sort_policy().to_string(),
                partition.app_sort_policy().to_string(),
            ),
            None => return,
        };
        let queue_sorter = self
            .sorters
            .queue_sorter(&queue_policy)
            .or_else(|| self.sorters.queue_sorter("fifo"))
            .expect("fifo queue sorter is always registered");
        let app_sorter = self
            .sorters
            .app_sorter(&app_policy)
            .or_else(|| self.sorters.app_sorter("fifo"))
            .expect("fifo app sorter is always registered");

        let root = match self.context.partition(name) {
            Some(partition) => partition.tree().root(),
            None => return,
        };
        self.visit_queue(name, root, &*queue_sorter, &*app_sorter, proposals);
    }

    fn visit_queue(
        &mut self,
        partition_name: &str,
        queue: QueueId,
        queue_sorter: &dyn crate::sorters::QueueSorter,
        app_sorter: &dyn crate::sorters::AppSorter,
        proposals: &mut Vec<AllocationProposal>,
    ) {
        let children = match self.context.partition(partition_name) {
            Some(partition) => partition.tree().sorted_child_queues(queue, queue_sorter),
            None => return,
        };
        match children {
            Some(children) => {
                for child in children {
                    self.visit_queue(partition_name, child, queue_sorter, app_sorter, proposals);
                }
            }
            None => self.allocate_leaf(partition_name, queue, app_sorter, proposals),
        }
    }

    fn allocate_leaf(
        &mut self,
        partition_name: &str,
        leaf: QueueId,
        app_sorter: &dyn crate::sorters::AppSorter,
        proposals: &mut Vec<AllocationProposal>,
    ) {
        let app_ids = match self.context.partition(partition_name) {
            Some(partition) => partition
                .tree()
                .sorted_applications(leaf, app_sorter)
                .unwrap_or_default(),
            None => return,
        };
        for app_id in app_ids {
            loop {
                let Some(partition) = self.context.partition(partition_name) else {
                    return;
                };
                // headroom moves with every tentative allocation, recheck
                // before each ask
                let headroom = partition.tree().get_headroom(leaf);
                let next_ask = partition.tree().application(leaf, &app_id).and_then(|app| {
                    app.sorted_ask_keys().into_iter().find_map(|key| {
                        let ask = app.ask(&key)?;
                        if ask.remaining_repeat == 0 {
                            return None;
                        }
                        if !ask.resource.fits_in_option(headroom.as_ref()) {
                            return None;
                        }
                        Some((key, ask.resource.clone()))
                    })
                });
                let Some((key, resource)) = next_ask else {
                    break;
                };

                let selected = self
                    .node_selector
                    .select(&resource, &partition.sorted_nodes());
                let Some(node_id) = selected else {
                    // the ask fits the queue but no node can host it right
                    // now: leave a retry hint for the allocator
                    if let Some(partition) = self.context.partition_mut(partition_name) {
                        partition.tree_mut().reserve(leaf, &app_id);
                    }
                    break;
                };

                let Some(partition) = self.context.partition_mut(partition_name) else {
                    return;
                };
                if partition
                    .tree_mut()
                    .update_ask_repeat(leaf, &app_id, &key, -1)
                    .is_err()
                {
                    break;
                }
                partition.tree_mut().inc_allocating(leaf, &resource);
                if let Some(app) = partition.tree_mut().application_mut(leaf, &app_id) {
                    app.mark_started();
                }
                partition.tree_mut().un_reserve(leaf, &app_id);
                if let Some(node) = partition.node_mut(&node_id) {
                    node.occupy(&resource);
                }
                let queue_path = partition
                    .tree()
                    .queue(leaf)
                    .map(|node| node.info().path().to_string())
                    .unwrap_or_default();
                debug!(
                    partition = %partition_name,
                    queue = %queue_path,
                    application = %app_id,
                    allocation_key = %key,
                    node = %node_id,
                    "allocation proposed"
                );
                proposals.push(AllocationProposal {
                    uuid: Uuid::new_v4(),
                    partition: partition_name.to_string(),
                    queue: leaf,
                    queue_path,
                    application_id: app_id.clone(),
                    allocation_key: key,
                    node_id,
                    resource,
                });
            }
        }
    }

    /// Confirm a proposal: `allocating` becomes `allocated`, enforcing the
    /// queue max along the chain. On failure the tentative state is
    /// restored and the error returned.
    pub fn confirm(&mut self, proposal: &AllocationProposal) -> Result<Allocation, SchedulerError> {
        let partition = self
            .context
            .partition_mut(&proposal.partition)
            .ok_or_else(|| SchedulerError::not_found("partition", proposal.partition.clone()))?;
        partition
            .tree_mut()
            .dec_allocating(proposal.queue, &proposal.resource);
        if let Err(err) = partition
            .tree_mut()
            .inc_allocated(proposal.queue, &proposal.resource, true)
        {
            partition
                .tree_mut()
                .inc_allocating(proposal.queue, &proposal.resource);
            return Err(err);
        }
        Ok(Allocation {
            uuid: proposal.uuid,
            allocation_key: proposal.allocation_key.clone(),
            application_id: proposal.application_id.clone(),
            queue_path: proposal.queue_path.clone(),
            node_id: proposal.node_id.clone(),
            partition: proposal.partition.clone(),
            resource: proposal.resource.clone(),
        })
    }

    /// Reject a proposal: release the tentative allocation and restore the
    /// ask's outstanding demand.
    pub fn reject(&mut self, proposal: &AllocationProposal) {
        let Some(partition) = self.context.partition_mut(&proposal.partition) else {
            return;
        };
        partition
            .tree_mut()
            .dec_allocating(proposal.queue, &proposal.resource);
        if let Some(node) = partition.node_mut(&proposal.node_id) {
            node.release(&proposal.resource);
        }
        let restored = partition.tree_mut().update_ask_repeat(
            proposal.queue,
            &proposal.application_id,
            &proposal.allocation_key,
            1,
        );
        if restored.is_err() {
            // the ask was fully consumed and removed: recreate it with the
            // single returned repeat
            let ask = AllocationAsk::new(
                proposal.allocation_key.clone(),
                proposal.application_id.clone(),
                proposal.resource.clone(),
                1,
            );
            if partition.tree_mut().add_ask(proposal.queue, ask).is_err() {
                warn!(
                    application = %proposal.application_id,
                    allocation_key = %proposal.allocation_key,
                    "rejected allocation for removed application, demand dropped"
                );
            }
        }
    }

    // ---- preemption ------------------------------------------------------

    /// One preemption single step: skip when no leaf is starved, otherwise
    /// snapshot the cluster, run the policy chain and mark the live queues'
    /// preempting counters with the computed preemptable amounts.
    pub fn single_step_preemption(&mut self) {
        if !self.context.need_preemption() {
            return;
        }
        let mut snapshot = PreemptionContext::from_cluster(&self.context);
        for policy in &self.preemption_policies {
            for name in snapshot.partition_names() {
                if let Some(partition_snapshot) = snapshot.partition_mut(&name) {
                    policy.compute(partition_snapshot);
                }
            }
        }
        // apply the marks to the live tree
        for name in snapshot.partition_names() {
            let Some(partition_snapshot) = snapshot.partition_mut(&name) else {
                continue;
            };
            let paths: Vec<String> = partition_snapshot.leaf_paths().to_vec();
            let mut marks: Vec<(QueueId, Resource)> = Vec::new();
            for path in &paths {
                if let Some(leaf) = partition_snapshot.leaf_mut(path) {
                    let preemptable = leaf.resources().preemptable.clone();
                    if !preemptable.is_zero() {
                        leaf.resources_mut().marked_preempted = preemptable.clone();
                        marks.push((leaf.queue(), preemptable));
                    }
                }
            }
            if let Some(partition) = self.context.partition_mut(&name) {
                for (queue, preemptable) in marks {
                    partition.tree_mut().set_preempting(queue, preemptable);
                }
            }
        }
        self.preemption_context = Some(snapshot);
    }
}
