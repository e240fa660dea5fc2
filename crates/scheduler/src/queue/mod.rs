//! Scheduling Queue Tree
//!
//! The queue hierarchy is arena-backed: nodes live in a slot vector and refer
//! to each other through `QueueId` indices, so parent/child links never form
//! ownership cycles. Removing a queue tombstones its slot and detaches it
//! from the parent's child map.
//!
//! Each node embeds its cache record (`QueueInfo`) and carries the
//! scheduling-side state: the hierarchical `pending` and `allocating`
//! counters (additive up to the root), the per-queue `preempting` counter,
//! the application set (leaves only) and the reservation hints.
//!
//! The tree is owned by the single scheduling task and carries no locks.

use std::collections::HashMap;
use tracing::debug;

use crate::application::{AllocationAsk, PendingChange, SchedulingApp};
use crate::cache::{QueueEvent, QueueInfo};
use crate::resources::{min_option, Resource};
use crate::sorters::{AppSorter, QueueSorter};
use crate::{ApplicationId, SchedulerError};

/// Index of a queue in its tree's arena. Only valid for the tree that issued
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

#[cfg(test)]
impl QueueId {
    pub(crate) fn for_tests(raw: usize) -> Self {
        QueueId(raw)
    }
}

/// A single queue: cache record plus scheduling state.
#[derive(Debug)]
pub struct QueueNode {
    info: QueueInfo,
    parent: Option<QueueId>,
    children: HashMap<String, QueueId>,
    applications: HashMap<ApplicationId, SchedulingApp>,
    reserved_apps: HashMap<ApplicationId, u32>,
    pending: Resource,
    allocating: Resource,
    preempting: Resource,
}

impl QueueNode {
    fn new(info: QueueInfo, parent: Option<QueueId>) -> Self {
        QueueNode {
            info,
            parent,
            children: HashMap::new(),
            applications: HashMap::new(),
            reserved_apps: HashMap::new(),
            pending: Resource::new(),
            allocating: Resource::new(),
            preempting: Resource::new(),
        }
    }

    pub fn info(&self) -> &QueueInfo {
        &self.info
    }

    pub fn parent(&self) -> Option<QueueId> {
        self.parent
    }

    pub fn children(&self) -> &HashMap<String, QueueId> {
        &self.children
    }

    pub fn applications(&self) -> &HashMap<ApplicationId, SchedulingApp> {
        &self.applications
    }

    pub fn pending(&self) -> &Resource {
        &self.pending
    }

    pub fn allocating(&self) -> &Resource {
        &self.allocating
    }

    pub fn preempting(&self) -> &Resource {
        &self.preempting
    }

    /// What the scheduler currently believes this queue holds: confirmed
    /// allocations plus in-flight ones.
    pub fn assumed_allocated(&self) -> Resource {
        self.info.allocated().add(&self.allocating)
    }

    /// A queue with no children and no applications.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.applications.is_empty()
    }

    /// Reservation count for an application, zero when absent.
    pub fn reservations(&self, application_id: &str) -> u32 {
        self.reserved_apps.get(application_id).copied().unwrap_or(0)
    }

    /// Number of applications with at least one reservation.
    pub fn reserved_app_count(&self) -> usize {
        self.reserved_apps.len()
    }
}

/// Arena-backed queue hierarchy for one partition.
#[derive(Debug)]
pub struct QueueTree {
    slots: Vec<Option<QueueNode>>,
    root: QueueId,
}

impl QueueTree {
    /// Create a tree holding only the root queue. The root must be a parent.
    pub fn new(root_info: QueueInfo) -> Result<Self, SchedulerError> {
        if root_info.is_leaf() {
            return Err(SchedulerError::Config(
                "root queue must be a parent queue".to_string(),
            ));
        }
        Ok(QueueTree {
            slots: vec![Some(QueueNode::new(root_info, None))],
            root: QueueId(0),
        })
    }

    pub fn root(&self) -> QueueId {
        self.root
    }

    /// Borrow a queue, `None` when the id was removed.
    pub fn queue(&self, id: QueueId) -> Option<&QueueNode> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn node(&self, id: QueueId) -> &QueueNode {
        self.slots[id.0].as_ref().expect("queue slot tombstoned")
    }

    fn node_mut(&mut self, id: QueueId) -> &mut QueueNode {
        self.slots[id.0].as_mut().expect("queue slot tombstoned")
    }

    /// Add a child queue under `parent`.
    ///
    /// The child's `QueueInfo` carries its full dot-separated path. Sibling
    /// names must be unique; attaching under a leaf is a configuration
    /// error.
    pub fn add_queue(&mut self, parent: QueueId, info: QueueInfo) -> Result<QueueId, SchedulerError> {
        let name = info.name().to_string();
        {
            let parent_node = self
                .queue(parent)
                .ok_or_else(|| SchedulerError::not_found("queue", format!("{:?}", parent)))?;
            if parent_node.info.is_leaf() {
                return Err(SchedulerError::Config(format!(
                    "cannot add queue '{}' under leaf queue '{}'",
                    name,
                    parent_node.info.path()
                )));
            }
            if parent_node.children.contains_key(&name) {
                return Err(SchedulerError::Config(format!(
                    "duplicate queue name '{}' under '{}'",
                    name,
                    parent_node.info.path()
                )));
            }
        }
        let id = QueueId(self.slots.len());
        self.slots.push(Some(QueueNode::new(info, Some(parent))));
        self.node_mut(parent).children.insert(name, id);
        Ok(id)
    }

    /// Resolve a dot-separated path (starting at the root's name) to a
    /// queue id.
    pub fn queue_by_path(&self, path: &str) -> Option<QueueId> {
        let mut segments = path.split('.');
        let root_name = segments.next()?;
        if root_name != self.node(self.root).info.name() {
            return None;
        }
        let mut current = self.root;
        for segment in segments {
            current = *self.node(current).children.get(segment)?;
        }
        Some(current)
    }

    /// All live leaf queues, ordered by path for deterministic traversal.
    pub fn leaf_ids(&self) -> Vec<QueueId> {
        let mut leaves: Vec<QueueId> = (0..self.slots.len())
            .map(QueueId)
            .filter(|id| {
                self.queue(*id)
                    .map(|node| node.info.is_leaf())
                    .unwrap_or(false)
            })
            .collect();
        leaves.sort_by(|a, b| self.node(*a).info.path().cmp(self.node(*b).info.path()));
        leaves
    }

    // ---- lifecycle -------------------------------------------------------

    /// Drive the lifecycle state machine of a single queue.
    pub fn handle_queue_event(
        &mut self,
        id: QueueId,
        event: QueueEvent,
    ) -> Result<(), SchedulerError> {
        self.node_mut(id).info.handle_event(event)
    }

    /// Mark a queue and all its descendants for removal. Managed queues move
    /// to draining; dynamic queues skip the draining state entirely and stay
    /// removable as soon as they are empty.
    pub fn mark_for_removal(&mut self, id: QueueId) {
        let children: Vec<QueueId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.mark_for_removal(child);
        }
        let node = self.node_mut(id);
        if node.info.is_managed() {
            // Remove is legal from every state, including draining
            let _ = node.info.handle_event(QueueEvent::Remove);
        }
    }

    /// Remove a queue from the tree.
    ///
    /// Returns false without changes when the queue is the root, still has
    /// children or applications, or is a managed queue not in draining
    /// state.
    pub fn remove_queue(&mut self, id: QueueId) -> bool {
        let (parent, name) = {
            let node = match self.queue(id) {
                Some(node) => node,
                None => return false,
            };
            let parent = match node.parent {
                Some(parent) => parent,
                None => return false,
            };
            if !node.is_empty() {
                return false;
            }
            if node.info.is_managed() && !node.info.is_draining() {
                return false;
            }
            (parent, node.info.name().to_string())
        };
        debug!(queue = %self.node(id).info.path(), "removing queue");
        self.node_mut(parent).children.remove(&name);
        self.slots[id.0] = None;
        true
    }

    // ---- hierarchical counters ------------------------------------------

    /// Increment pending along the chain from `id` up to the root.
    pub fn inc_pending(&mut self, id: QueueId, delta: &Resource) {
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            node.pending.add_assign(delta);
            current = node.parent;
        }
    }

    /// Decrement pending along the chain, clamping each queue at zero.
    pub fn dec_pending(&mut self, id: QueueId, delta: &Resource) {
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            node.pending.sub_assign_saturating(delta);
            current = node.parent;
        }
    }

    /// Increment allocating along the chain from `id` up to the root.
    pub fn inc_allocating(&mut self, id: QueueId, delta: &Resource) {
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            node.allocating.add_assign(delta);
            current = node.parent;
        }
    }

    /// Decrement allocating along the chain, clamping each queue at zero.
    pub fn dec_allocating(&mut self, id: QueueId, delta: &Resource) {
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            node.allocating.sub_assign_saturating(delta);
            current = node.parent;
        }
    }

    /// Increment the per-queue preempting counter. Does not propagate.
    pub fn inc_preempting(&mut self, id: QueueId, delta: &Resource) {
        self.node_mut(id).preempting.add_assign(delta);
    }

    /// Decrement the per-queue preempting counter, clamping at zero.
    pub fn dec_preempting(&mut self, id: QueueId, delta: &Resource) {
        self.node_mut(id).preempting.sub_assign_saturating(delta);
    }

    /// Overwrite the per-queue preempting counter.
    pub fn set_preempting(&mut self, id: QueueId, value: Resource) {
        self.node_mut(id).preempting = value;
    }

    /// Add confirmed allocations along the chain up to the root, optionally
    /// enforcing each queue's configured max. On a violation nothing is
    /// changed anywhere in the chain.
    pub fn inc_allocated(
        &mut self,
        id: QueueId,
        delta: &Resource,
        check_max: bool,
    ) -> Result<(), SchedulerError> {
        if check_max {
            let mut current = Some(id);
            while let Some(queue) = current {
                let node = self.node(queue);
                if let Some(max) = node.info.max() {
                    let next = node.info.allocated().add(delta);
                    if !next.fits_in(max) {
                        return Err(SchedulerError::Capacity {
                            queue: node.info.path().to_string(),
                            requested: next.to_string(),
                            limit: max.to_string(),
                        });
                    }
                }
                current = node.parent;
            }
        }
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            // checked above, must not fail here
            node.info
                .inc_allocated(delta, false)
                .expect("unchecked allocated increment failed");
            current = node.parent;
        }
        Ok(())
    }

    /// Release confirmed allocations along the chain, clamping at zero.
    pub fn dec_allocated(&mut self, id: QueueId, delta: &Resource) {
        let mut current = Some(id);
        while let Some(queue) = current {
            let node = self.node_mut(queue);
            node.info.dec_allocated(delta);
            current = node.parent;
        }
    }

    // ---- derived quantities ---------------------------------------------

    /// Confirmed plus in-flight allocations for a queue.
    pub fn assumed_allocated(&self, id: QueueId) -> Resource {
        self.node(id).assumed_allocated()
    }

    /// Tightest headroom along the path from `id` to the root:
    /// `min(max − assumed, headroom(parent))`, where a queue without a
    /// configured max contributes nothing and `None` means unbounded.
    /// Components never go negative.
    pub fn get_headroom(&self, id: QueueId) -> Option<Resource> {
        let node = self.node(id);
        let local = node
            .info
            .max()
            .map(|max| max.sub(&node.assumed_allocated()));
        let parent = node.parent.and_then(|p| self.get_headroom(p));
        min_option(local, parent)
    }

    /// Effective per-resource ceiling visible at a queue: the root's
    /// configured max, tightened by every configured max down the path.
    /// Types restricted upstream but unlisted locally resolve to zero.
    pub fn get_max_resource(&self, id: QueueId) -> Option<Resource> {
        let node = self.node(id);
        let own = node.info.max();
        match node.parent {
            None => own.cloned(),
            Some(parent) => match (self.get_max_resource(parent), own) {
                (None, own) => own.cloned(),
                (Some(inherited), None) => Some(inherited),
                (Some(inherited), Some(own)) => Some(inherited.component_min(own)),
            },
        }
    }

    // ---- applications ----------------------------------------------------

    /// Register an application on a leaf. Re-adding the same id replaces the
    /// entry. Pending is not touched: demand only enters through asks.
    pub fn add_application(
        &mut self,
        id: QueueId,
        app: SchedulingApp,
    ) -> Result<(), SchedulerError> {
        let node = self.node_mut(id);
        if !node.info.is_leaf() {
            return Err(SchedulerError::State {
                queue: node.info.path().to_string(),
                state: "parent".to_string(),
                event: "add application".to_string(),
            });
        }
        node.applications.insert(app.id().to_string(), app);
        Ok(())
    }

    /// Remove an application, correcting the pending chain by whatever the
    /// app still had outstanding. Unknown ids are a no-op.
    pub fn remove_application(
        &mut self,
        id: QueueId,
        application_id: &str,
    ) -> Option<SchedulingApp> {
        let app = self.node_mut(id).applications.remove(application_id)?;
        let outstanding = app.pending().clone();
        if !outstanding.is_zero() {
            self.dec_pending(id, &outstanding);
        }
        Some(app)
    }

    pub fn application(&self, id: QueueId, application_id: &str) -> Option<&SchedulingApp> {
        self.node(id).applications.get(application_id)
    }

    pub(crate) fn application_mut(
        &mut self,
        id: QueueId,
        application_id: &str,
    ) -> Option<&mut SchedulingApp> {
        self.node_mut(id).applications.get_mut(application_id)
    }

    // ---- asks ------------------------------------------------------------

    /// Add or replace an allocation ask on an application of this leaf and
    /// propagate the pending delta up the chain.
    pub fn add_ask(&mut self, id: QueueId, ask: AllocationAsk) -> Result<(), SchedulerError> {
        let application_id = ask.application_id.clone();
        let (removed, added) = self
            .node_mut(id)
            .applications
            .get_mut(&application_id)
            .ok_or_else(|| SchedulerError::not_found("application", application_id))?
            .add_ask(ask);
        if let Some(old_total) = removed {
            self.dec_pending(id, &old_total);
        }
        self.inc_pending(id, &added);
        Ok(())
    }

    /// Update an ask's repeat count by a signed delta and propagate the
    /// resulting pending change up the chain.
    pub fn update_ask_repeat(
        &mut self,
        id: QueueId,
        application_id: &str,
        allocation_key: &str,
        delta: i64,
    ) -> Result<(), SchedulerError> {
        let change = self
            .node_mut(id)
            .applications
            .get_mut(application_id)
            .ok_or_else(|| SchedulerError::not_found("application", application_id))?
            .update_ask_repeat(allocation_key, delta)?;
        match change {
            PendingChange::Increased(gained) => self.inc_pending(id, &gained),
            PendingChange::Decreased(released) => self.dec_pending(id, &released),
            PendingChange::Unchanged => {}
        }
        Ok(())
    }

    /// Drop an ask outright, retracting whatever it still had outstanding
    /// from the pending chain.
    pub fn remove_ask(
        &mut self,
        id: QueueId,
        application_id: &str,
        allocation_key: &str,
    ) -> Result<(), SchedulerError> {
        let released = self
            .node_mut(id)
            .applications
            .get_mut(application_id)
            .ok_or_else(|| SchedulerError::not_found("application", application_id))?
            .remove_ask(allocation_key)
            .ok_or_else(|| SchedulerError::not_found("allocation ask", allocation_key))?;
        if !released.is_zero() {
            self.dec_pending(id, &released);
        }
        Ok(())
    }

    // ---- reservations ----------------------------------------------------

    /// Count a reservation for an application on this leaf.
    pub fn reserve(&mut self, id: QueueId, application_id: &str) {
        *self
            .node_mut(id)
            .reserved_apps
            .entry(application_id.to_string())
            .or_insert(0) += 1;
    }

    /// Drop one reservation; the entry disappears at zero. Unreserving an
    /// unknown application is a no-op.
    pub fn un_reserve(&mut self, id: QueueId, application_id: &str) {
        let node = self.node_mut(id);
        if let Some(count) = node.reserved_apps.get_mut(application_id) {
            *count -= 1;
            if *count == 0 {
                node.reserved_apps.remove(application_id);
            }
        }
    }

    // ---- sorted traversal ------------------------------------------------

    /// Children of a parent queue eligible for allocation, ordered by the
    /// given policy. Queues that are not running or have nothing pending are
    /// dropped. Returns `None` for leaves.
    pub fn sorted_child_queues(
        &self,
        id: QueueId,
        sorter: &dyn QueueSorter,
    ) -> Option<Vec<QueueId>> {
        let node = self.node(id);
        if node.info.is_leaf() {
            return None;
        }
        let mut eligible: Vec<QueueId> = node
            .children
            .values()
            .copied()
            .filter(|child| {
                let child = self.node(*child);
                child.info.is_running() && !child.pending.is_zero()
            })
            .collect();
        sorter.sort(self, &mut eligible);
        Some(eligible)
    }

    /// Applications of a leaf with outstanding demand, ordered by the given
    /// policy. Returns `None` for parents, which hold no applications.
    pub fn sorted_applications(
        &self,
        id: QueueId,
        sorter: &dyn AppSorter,
    ) -> Option<Vec<ApplicationId>> {
        let node = self.node(id);
        if !node.info.is_leaf() {
            return None;
        }
        let mut eligible: Vec<&SchedulingApp> = node
            .applications
            .values()
            .filter(|app| app.has_pending())
            .collect();
        sorter.sort(&mut eligible);
        Some(eligible.iter().map(|app| app.id().to_string()).collect())
    }
}
