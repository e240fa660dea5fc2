//! Pluggable Sort Policies
//!
//! The queue layer filters (running state, nonzero pending) and then hands
//! ordering to a policy. Policies are pure over their inputs and must be
//! deterministic: equal inputs give equal output, ties break on stable keys
//! (queue path, submission order). Policies are registered by name at
//! startup and looked up per partition.

use dashmap::DashMap;
use std::sync::Arc;

use crate::application::SchedulingApp;
use crate::queue::{QueueId, QueueTree};

/// Ordering policy for sibling queues under one parent.
pub trait QueueSorter: Send + Sync {
    fn sort(&self, tree: &QueueTree, queues: &mut Vec<QueueId>);
}

/// Ordering policy for the applications of one leaf. A policy may also
/// narrow the candidate set (see the state-aware policy).
pub trait AppSorter: Send + Sync {
    fn sort(&self, apps: &mut Vec<&SchedulingApp>);
}

/// Queues in path order. Paths encode creation structure, so this behaves
/// as a stable first-in ordering.
pub struct FifoQueueSorter;

impl QueueSorter for FifoQueueSorter {
    fn sort(&self, tree: &QueueTree, queues: &mut Vec<QueueId>) {
        queues.sort_by(|a, b| {
            let a = tree.queue(*a).map(|q| q.info().path()).unwrap_or("");
            let b = tree.queue(*b).map(|q| q.info().path()).unwrap_or("");
            a.cmp(b)
        });
    }
}

/// Fair ordering: the queue with the smallest dominant share of its
/// guaranteed resources goes first, so under-served queues get offered
/// capacity before well-served ones. Queues without a guarantee sort after
/// guaranteed ones once they hold anything; ties break on path.
pub struct FairQueueSorter;

impl FairQueueSorter {
    fn share(tree: &QueueTree, id: QueueId) -> f64 {
        let node = match tree.queue(id) {
            Some(node) => node,
            None => return f64::INFINITY,
        };
        let assumed = node.assumed_allocated();
        match node.info().guaranteed() {
            Some(guaranteed) if !guaranteed.is_zero() => assumed.dominant_share(guaranteed),
            _ if assumed.is_zero() => 0.0,
            _ => f64::INFINITY,
        }
    }
}

impl QueueSorter for FairQueueSorter {
    fn sort(&self, tree: &QueueTree, queues: &mut Vec<QueueId>) {
        queues.sort_by(|a, b| {
            Self::share(tree, *a)
                .total_cmp(&Self::share(tree, *b))
                .then_with(|| {
                    let a = tree.queue(*a).map(|q| q.info().path()).unwrap_or("");
                    let b = tree.queue(*b).map(|q| q.info().path()).unwrap_or("");
                    a.cmp(b)
                })
        });
    }
}

/// Applications in submission order.
pub struct FifoAppSorter;

impl AppSorter for FifoAppSorter {
    fn sort(&self, apps: &mut Vec<&SchedulingApp>) {
        apps.sort_by_key(|app| app.submission_seq());
    }
}

/// Fair ordering for applications: smallest outstanding demand first,
/// submission order as tie-break.
pub struct FairAppSorter;

impl FairAppSorter {
    fn magnitude(app: &SchedulingApp) -> u64 {
        app.pending().entries().map(|(_, quantity)| quantity).sum()
    }
}

impl AppSorter for FairAppSorter {
    fn sort(&self, apps: &mut Vec<&SchedulingApp>) {
        apps.sort_by(|a, b| {
            Self::magnitude(a)
                .cmp(&Self::magnitude(b))
                .then_with(|| a.submission_seq().cmp(&b.submission_seq()))
        });
    }
}

/// Submission order, admitting at most one application that has never been
/// allocated anything. Started applications always stay in; the oldest
/// unstarted one is let through so the backlog drains one app at a time.
pub struct StateAwareAppSorter;

impl AppSorter for StateAwareAppSorter {
    fn sort(&self, apps: &mut Vec<&SchedulingApp>) {
        apps.sort_by_key(|app| app.submission_seq());
        let mut unstarted_admitted = false;
        apps.retain(|app| {
            if app.started() {
                true
            } else if unstarted_admitted {
                false
            } else {
                unstarted_admitted = true;
                true
            }
        });
    }
}

/// By-name registry of sort policies, populated once at startup and read by
/// the allocation pass.
pub struct SortPolicyRegistry {
    queue_sorters: DashMap<String, Arc<dyn QueueSorter>>,
    app_sorters: DashMap<String, Arc<dyn AppSorter>>,
}

impl SortPolicyRegistry {
    /// Registry with the built-in policies: `fair`, `fifo` and `stateaware`.
    /// The state-aware policy only differs on the application side; for
    /// queues it falls back to fifo ordering.
    pub fn with_defaults() -> Self {
        let registry = SortPolicyRegistry {
            queue_sorters: DashMap::new(),
            app_sorters: DashMap::new(),
        };
        registry.register_queue_sorter("fifo", Arc::new(FifoQueueSorter));
        registry.register_queue_sorter("fair", Arc::new(FairQueueSorter));
        registry.register_queue_sorter("stateaware", Arc::new(FifoQueueSorter));
        registry.register_app_sorter("fifo", Arc::new(FifoAppSorter));
        registry.register_app_sorter("fair", Arc::new(FairAppSorter));
        registry.register_app_sorter("stateaware", Arc::new(StateAwareAppSorter));
        registry
    }

    pub fn register_queue_sorter(&self, name: impl Into<String>, sorter: Arc<dyn QueueSorter>) {
        self.queue_sorters.insert(name.into(), sorter);
    }

    pub fn register_app_sorter(&self, name: impl Into<String>, sorter: Arc<dyn AppSorter>) {
        self.app_sorters.insert(name.into(), sorter);
    }

    pub fn queue_sorter(&self, name: &str) -> Option<Arc<dyn QueueSorter>> {
        self.queue_sorters.get(name).map(|entry| entry.clone())
    }

    pub fn app_sorter(&self, name: &str) -> Option<Arc<dyn AppSorter>> {
        self.app_sorters.get(name).map(|entry| entry.clone())
    }
}

impl Default for SortPolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueueInfo, QueueRole};
    use crate::resources::Resource;
    use std::collections::HashMap;

    fn res(entries: &[(&str, u64)]) -> Resource {
        Resource::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    fn tree_with_two_leaves(guaranteed_a: Resource, guaranteed_b: Resource) -> (QueueTree, QueueId, QueueId) {
        let root = QueueInfo::managed(
            "root",
            "root",
            QueueRole::Parent,
            None,
            None,
            HashMap::new(),
        );
        let mut tree = QueueTree::new(root).unwrap();
        let root_id = tree.root();
        let a = tree
            .add_queue(
                root_id,
                QueueInfo::managed(
                    "a",
                    "root.a",
                    QueueRole::Leaf,
                    Some(guaranteed_a),
                    None,
                    HashMap::new(),
                ),
            )
            .unwrap();
        let b = tree
            .add_queue(
                root_id,
                QueueInfo::managed(
                    "b",
                    "root.b",
                    QueueRole::Leaf,
                    Some(guaranteed_b),
                    None,
                    HashMap::new(),
                ),
            )
            .unwrap();
        (tree, a, b)
    }

    #[test]
    fn test_fifo_queue_sorter_orders_by_path() {
        let (tree, a, b) = tree_with_two_leaves(res(&[("m", 1)]), res(&[("m", 1)]));
        let mut queues = vec![b, a];
        FifoQueueSorter.sort(&tree, &mut queues);
        assert_eq!(queues, vec![a, b]);
    }

    #[test]
    fn test_fair_queue_sorter_prefers_smaller_share() {
        let (mut tree, a, b) = tree_with_two_leaves(res(&[("m", 100)]), res(&[("m", 100)]));
        // queue b is using most of its guarantee, a nothing
        tree.inc_allocating(b, &res(&[("m", 80)]));
        let mut queues = vec![b, a];
        FairQueueSorter.sort(&tree, &mut queues);
        assert_eq!(queues, vec![a, b]);
    }

    #[test]
    fn test_fair_queue_sorter_tie_breaks_on_path() {
        let (tree, a, b) = tree_with_two_leaves(res(&[("m", 100)]), res(&[("m", 100)]));
        let mut queues = vec![b, a];
        FairQueueSorter.sort(&tree, &mut queues);
        assert_eq!(queues, vec![a, b]);
    }

    #[test]
    fn test_fifo_app_sorter() {
        let first = SchedulingApp::new("app-1", QueueId::for_tests(0), 1);
        let second = SchedulingApp::new("app-2", QueueId::for_tests(0), 2);
        let mut apps = vec![&second, &first];
        FifoAppSorter.sort(&mut apps);
        assert_eq!(apps[0].id(), "app-1");
        assert_eq!(apps[1].id(), "app-2");
    }

    #[test]
    fn test_stateaware_admits_single_unstarted() {
        let mut started = SchedulingApp::new("started", QueueId::for_tests(0), 0);
        started.mark_started();
        let new_one = SchedulingApp::new("new-1", QueueId::for_tests(0), 1);
        let new_two = SchedulingApp::new("new-2", QueueId::for_tests(0), 2);
        let mut apps = vec![&new_two, &started, &new_one];
        StateAwareAppSorter.sort(&mut apps);
        let ids: Vec<&str> = apps.iter().map(|app| app.id()).collect();
        assert_eq!(ids, vec!["started", "new-1"]);
    }

    #[test]
    fn test_registry_defaults() {
        let registry = SortPolicyRegistry::with_defaults();
        assert!(registry.queue_sorter("fair").is_some());
        assert!(registry.queue_sorter("fifo").is_some());
        assert!(registry.queue_sorter("stateaware").is_some());
        assert!(registry.app_sorter("stateaware").is_some());
        assert!(registry.queue_sorter("unknown").is_none());
    }
}
