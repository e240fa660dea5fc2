//! Preemption Engine
//!
//! A preemption pass runs as one single step on the scheduling task. It
//! builds a fresh snapshot of every partition's queue tree, a mirror tree
//! of preemption queue contexts owned solely by the pass, and runs the
//! registered preemption policies over it. The default policy computes each
//! leaf's ideal share with Dominant Resource Fairness and marks usage above
//! the ideal as preemptable, never dipping below a queue's guaranteed
//! share.
//!
//! Everything here is used under the single scheduling task, so no locks
//! are needed.

use std::collections::HashMap;
use tracing::debug;

use crate::context::{ClusterSchedulingContext, PartitionContext};
use crate::queue::{QueueId, QueueTree};
use crate::resources::Resource;

/// Numeric state of one queue, snapshotted for preemption decisions.
#[derive(Debug, Clone, Default)]
pub struct QueuePreemptCalcResource {
    pub guaranteed: Resource,
    pub used: Resource,
    pub pending: Resource,
    pub max: Option<Resource>,
    pub ideal: Resource,
    pub marked_preempted: Resource,
    /// How much of this queue's usage other queues may reclaim.
    pub preemptable: Resource,
}

impl QueuePreemptCalcResource {
    fn from_queue(tree: &QueueTree, id: QueueId) -> Self {
        let node = tree.queue(id).expect("snapshot of removed queue");
        QueuePreemptCalcResource {
            guaranteed: node.info().guaranteed().cloned().unwrap_or_default(),
            used: node.assumed_allocated(),
            pending: node.pending().clone(),
            max: node.info().max().cloned(),
            ..QueuePreemptCalcResource::default()
        }
    }
}

/// Mirror of one live queue inside the snapshot.
#[derive(Debug)]
pub struct PreemptionQueueContext {
    queue_path: String,
    queue: QueueId,
    resources: QueuePreemptCalcResource,
    children: HashMap<String, PreemptionQueueContext>,
}

impl PreemptionQueueContext {
    pub fn queue_path(&self) -> &str {
        &self.queue_path
    }

    /// Identity of the mirrored live queue.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn resources(&self) -> &QueuePreemptCalcResource {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut QueuePreemptCalcResource {
        &mut self.resources
    }

    pub fn children(&self) -> &HashMap<String, PreemptionQueueContext> {
        &self.children
    }
}

/// Snapshot of one partition for the current preemption pass.
#[derive(Debug)]
pub struct PreemptionPartitionContext {
    partition_total: Resource,
    root: PreemptionQueueContext,
    leaf_paths: Vec<String>,
    starved: Vec<String>,
}

impl PreemptionPartitionContext {
    /// Snapshot a live partition: copy queue identities and numeric state
    /// into a mirror tree. Runs on the scheduling task, so the live tree
    /// cannot change underneath it.
    pub fn from_partition(partition: &PartitionContext) -> Self {
        let tree = partition.tree();
        let mut leaf_paths = Vec::new();
        let root = build_queue_context(tree, tree.root(), &mut leaf_paths);
        leaf_paths.sort();
        PreemptionPartitionContext {
            partition_total: partition.total_capacity().clone(),
            root,
            leaf_paths,
            starved: Vec::new(),
        }
    }

    pub fn partition_total(&self) -> &Resource {
        &self.partition_total
    }

    pub fn root(&self) -> &PreemptionQueueContext {
        &self.root
    }

    /// Leaf queue paths, lexicographically sorted. This order is the DRF
    /// tie-break.
    pub fn leaf_paths(&self) -> &[String] {
        &self.leaf_paths
    }

    /// Leaves flagged as starved: below guaranteed with outstanding demand.
    /// Victim selection downstream reads these together with the
    /// preemptable marks.
    pub fn starved(&self) -> &[String] {
        &self.starved
    }

    pub fn mark_starved(&mut self, path: impl Into<String>) {
        self.starved.push(path.into());
    }

    pub fn leaf(&self, path: &str) -> Option<&PreemptionQueueContext> {
        let mut segments = path.split('.');
        let root_name = segments.next()?;
        if root_name != last_segment(&self.root.queue_path) {
            return None;
        }
        let mut current = &self.root;
        for segment in segments {
            current = current.children.get(segment)?;
        }
        Some(current)
    }

    pub fn leaf_mut(&mut self, path: &str) -> Option<&mut PreemptionQueueContext> {
        let mut segments = path.split('.');
        let root_name = segments.next()?;
        if root_name != last_segment(&self.root.queue_path) {
            return None;
        }
        let mut current = &mut self.root;
        for segment in segments {
            current = current.children.get_mut(segment)?;
        }
        Some(current)
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn build_queue_context(
    tree: &QueueTree,
    id: QueueId,
    leaf_paths: &mut Vec<String>,
) -> PreemptionQueueContext {
    let node = tree.queue(id).expect("snapshot of removed queue");
    let mut children = HashMap::new();
    for (name, child) in node.children() {
        children.insert(name.clone(), build_queue_context(tree, *child, leaf_paths));
    }
    if node.info().is_leaf() {
        leaf_paths.push(node.info().path().to_string());
    }
    PreemptionQueueContext {
        queue_path: node.info().path().to_string(),
        queue: id,
        resources: QueuePreemptCalcResource::from_queue(tree, id),
        children,
    }
}

/// Snapshot of the whole cluster, one mirror tree per partition. Owned by
/// the current preemption pass and discarded when the pass ends.
#[derive(Debug)]
pub struct PreemptionContext {
    partitions: HashMap<String, PreemptionPartitionContext>,
}

impl PreemptionContext {
    pub fn from_cluster(cluster: &ClusterSchedulingContext) -> Self {
        let mut partitions = HashMap::new();
        for name in cluster.partition_names() {
            if let Some(partition) = cluster.partition(&name) {
                partitions.insert(name, PreemptionPartitionContext::from_partition(partition));
            }
        }
        PreemptionContext { partitions }
    }

    pub fn partition(&self, name: &str) -> Option<&PreemptionPartitionContext> {
        self.partitions.get(name)
    }

    pub fn partition_mut(&mut self, name: &str) -> Option<&mut PreemptionPartitionContext> {
        self.partitions.get_mut(name)
    }

    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A preemption policy computes ideal shares and preemptable amounts over
/// one partition snapshot. Policies run in registration order.
pub trait PreemptionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn compute(&self, partition: &mut PreemptionPartitionContext);
}

/// The default policy chain.
pub fn default_policies() -> Vec<Box<dyn PreemptionPolicy>> {
    vec![Box::new(DrfPreemptionPolicy)]
}

/// Dominant Resource Fairness preemption.
///
/// Guaranteed shares are water-filled first; remaining capacity is handed
/// out in rounds to the leaf with the smallest dominant share of its ideal
/// allocation, ties broken by lexicographically smaller queue path. Usage
/// above the resulting ideal is preemptable; a queue is never marked below
/// its guaranteed share.
pub struct DrfPreemptionPolicy;

impl DrfPreemptionPolicy {
    fn deficit(resources: &QueuePreemptCalcResource) -> Resource {
        resources
            .used
            .add(&resources.pending)
            .sub(&resources.ideal)
    }
}

impl PreemptionPolicy for DrfPreemptionPolicy {
    fn name(&self) -> &'static str {
        "drf"
    }

    fn compute(&self, partition: &mut PreemptionPartitionContext) {
        let total = partition.partition_total().clone();
        let paths: Vec<String> = partition.leaf_paths().to_vec();
        let mut remaining = total.clone();

        // water-fill guaranteed shares, capped by each leaf's demand
        for path in &paths {
            let leaf = match partition.leaf_mut(path) {
                Some(leaf) => leaf,
                None => continue,
            };
            let resources = leaf.resources_mut();
            let demand = resources.used.add(&resources.pending);
            resources.ideal = resources.guaranteed.component_min(&demand);
            remaining.sub_assign_saturating(&resources.ideal);
        }

        // distribute the slack in DRF order until demand or capacity runs
        // out; the leaf with the smallest dominant share goes first
        let mut exhausted = vec![false; paths.len()];
        loop {
            let mut best: Option<(f64, usize)> = None;
            for (index, path) in paths.iter().enumerate() {
                if exhausted[index] {
                    continue;
                }
                let leaf = match partition.leaf(path) {
                    Some(leaf) => leaf,
                    None => {
                        exhausted[index] = true;
                        continue;
                    }
                };
                if Self::deficit(leaf.resources()).is_zero() {
                    exhausted[index] = true;
                    continue;
                }
                let share = leaf.resources().ideal.dominant_share(&total);
                // strict comparison keeps the lexicographically smaller
                // path on equal shares, since paths iterate sorted
                if best.map(|(s, _)| share < s).unwrap_or(true) {
                    best = Some((share, index));
                }
            }
            let Some((_, index)) = best else { break };
            let path = &paths[index];
            let leaf = match partition.leaf_mut(path) {
                Some(leaf) => leaf,
                None => {
                    exhausted[index] = true;
                    continue;
                }
            };
            let grant = Self::deficit(leaf.resources()).component_min(&remaining);
            if grant.is_zero() {
                exhausted[index] = true;
                continue;
            }
            leaf.resources_mut().ideal.add_assign(&grant);
            remaining.sub_assign_saturating(&grant);
        }

        // usage above the ideal is preemptable; queues at or below their
        // guaranteed share with demand are the starved beneficiaries
        let mut starved = Vec::new();
        for path in &paths {
            let leaf = match partition.leaf_mut(path) {
                Some(leaf) => leaf,
                None => continue,
            };
            let resources = leaf.resources_mut();
            resources.preemptable = resources.used.sub(&resources.ideal);
            if !resources.preemptable.is_zero() {
                debug!(queue = %path, preemptable = %resources.preemptable, "queue marked preemptable");
            }
            if !resources.pending.is_zero() && resources.used.fits_in(&resources.guaranteed) {
                starved.push(path.clone());
            }
        }
        for path in starved {
            partition.mark_starved(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::context::NodeInfo;
    use std::collections::HashMap as Map;

    fn res(entries: &[(&str, u64)]) -> Resource {
        Resource::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    fn cluster_two_queues() -> ClusterSchedulingContext {
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              guaranteed:
                mem: 100
          - name: b
            resources:
              guaranteed:
                mem: 100
"#;
        let config = config::parse(document).unwrap();
        ClusterSchedulingContext::from_config(&config).unwrap()
    }

    #[test]
    fn test_snapshot_mirrors_tree() {
        let mut cluster = cluster_two_queues();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new("node-1", Map::new(), res(&[("mem", 200)])))
            .unwrap();
        let leaf_a = partition.tree().queue_by_path("root.a").unwrap();
        partition.tree_mut().inc_pending(leaf_a, &res(&[("mem", 50)]));

        let snapshot = PreemptionContext::from_cluster(&cluster);
        let partition_snapshot = snapshot.partition("default").unwrap();
        assert_eq!(partition_snapshot.partition_total(), &res(&[("mem", 200)]));
        assert_eq!(
            partition_snapshot.leaf_paths(),
            &["root.a".to_string(), "root.b".to_string()]
        );
        let leaf = partition_snapshot.leaf("root.a").unwrap();
        assert_eq!(leaf.queue(), leaf_a);
        assert_eq!(leaf.resources().pending, res(&[("mem", 50)]));
        assert_eq!(leaf.resources().guaranteed, res(&[("mem", 100)]));
        assert!(leaf.resources().ideal.is_zero());
    }

    #[test]
    fn test_drf_marks_over_served_queue() {
        // queue a: guaranteed 100, used 50, pending 50
        // queue b: guaranteed 100, used 150, no pending
        // total 200 => ideal(b) = 100, preemptable(b) = 50
        let mut cluster = cluster_two_queues();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new("node-1", Map::new(), res(&[("mem", 200)])))
            .unwrap();
        let leaf_a = partition.tree().queue_by_path("root.a").unwrap();
        let leaf_b = partition.tree().queue_by_path("root.b").unwrap();
        partition
            .tree_mut()
            .inc_allocated(leaf_a, &res(&[("mem", 50)]), false)
            .unwrap();
        partition.tree_mut().inc_pending(leaf_a, &res(&[("mem", 50)]));
        partition
            .tree_mut()
            .inc_allocated(leaf_b, &res(&[("mem", 150)]), false)
            .unwrap();

        let mut snapshot = PreemptionContext::from_cluster(&cluster);
        let partition_snapshot = snapshot.partition_mut("default").unwrap();
        DrfPreemptionPolicy.compute(partition_snapshot);

        let a = partition_snapshot.leaf("root.a").unwrap().resources();
        let b = partition_snapshot.leaf("root.b").unwrap().resources();
        assert_eq!(a.ideal, res(&[("mem", 100)]));
        assert!(a.preemptable.is_zero());
        assert_eq!(b.ideal, res(&[("mem", 100)]));
        assert_eq!(b.preemptable, res(&[("mem", 50)]));
        // queue a is the starved beneficiary
        assert_eq!(partition_snapshot.starved(), &["root.a".to_string()]);
    }

    #[test]
    fn test_drf_never_marks_below_guaranteed() {
        // both queues above guaranteed; the sum of preemptable amounts must
        // stay within the sum of (used - guaranteed)+
        let mut cluster = cluster_two_queues();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new("node-1", Map::new(), res(&[("mem", 250)])))
            .unwrap();
        let leaf_a = partition.tree().queue_by_path("root.a").unwrap();
        let leaf_b = partition.tree().queue_by_path("root.b").unwrap();
        partition
            .tree_mut()
            .inc_allocated(leaf_a, &res(&[("mem", 120)]), false)
            .unwrap();
        partition.tree_mut().inc_pending(leaf_a, &res(&[("mem", 10)]));
        partition
            .tree_mut()
            .inc_allocated(leaf_b, &res(&[("mem", 130)]), false)
            .unwrap();

        let mut snapshot = PreemptionContext::from_cluster(&cluster);
        let partition_snapshot = snapshot.partition_mut("default").unwrap();
        DrfPreemptionPolicy.compute(partition_snapshot);

        let a = partition_snapshot.leaf("root.a").unwrap().resources();
        let b = partition_snapshot.leaf("root.b").unwrap().resources();
        let over_served_sum = 20 + 30; // (120-100)+ + (130-100)+
        let preemptable_sum = a.preemptable.get("mem") + b.preemptable.get("mem");
        assert!(preemptable_sum <= over_served_sum);
        // ideal never sinks below the guaranteed share
        assert!(res(&[("mem", 100)]).fits_in(&a.ideal));
        assert!(res(&[("mem", 100)]).fits_in(&b.ideal));
    }

    #[test]
    fn test_drf_tie_breaks_on_lexicographic_path() {
        // no guarantees, equal demand, capacity for only one queue: the
        // lexicographically smaller path wins the slack round
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
          - name: b
"#;
        let config = config::parse(document).unwrap();
        let mut cluster = ClusterSchedulingContext::from_config(&config).unwrap();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new("node-1", Map::new(), res(&[("mem", 100)])))
            .unwrap();
        for path in ["root.a", "root.b"] {
            let leaf = partition.tree().queue_by_path(path).unwrap();
            partition.tree_mut().inc_pending(leaf, &res(&[("mem", 100)]));
        }

        let mut snapshot = PreemptionContext::from_cluster(&cluster);
        let partition_snapshot = snapshot.partition_mut("default").unwrap();
        DrfPreemptionPolicy.compute(partition_snapshot);

        let a = partition_snapshot.leaf("root.a").unwrap().resources();
        let b = partition_snapshot.leaf("root.b").unwrap().resources();
        assert_eq!(a.ideal, res(&[("mem", 100)]));
        assert!(b.ideal.is_zero());
    }

    #[test]
    fn test_drf_multi_resource_dominant_share() {
        // leaf a dominates on cpu, leaf b on mem; DRF hands slack to the
        // queue with the smaller dominant share first
        let document = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
          - name: b
"#;
        let config = config::parse(document).unwrap();
        let mut cluster = ClusterSchedulingContext::from_config(&config).unwrap();
        let partition = cluster.partition_mut("default").unwrap();
        partition
            .add_node(NodeInfo::new(
                "node-1",
                Map::new(),
                res(&[("mem", 100), ("cpu", 100)]),
            ))
            .unwrap();
        let leaf_a = partition.tree().queue_by_path("root.a").unwrap();
        let leaf_b = partition.tree().queue_by_path("root.b").unwrap();
        // a already uses 60 cpu; b uses 20 mem; both want 20 more cpu
        partition
            .tree_mut()
            .inc_allocated(leaf_a, &res(&[("cpu", 60)]), false)
            .unwrap();
        partition.tree_mut().inc_pending(leaf_a, &res(&[("cpu", 20)]));
        partition
            .tree_mut()
            .inc_allocated(leaf_b, &res(&[("mem", 20)]), false)
            .unwrap();
        partition.tree_mut().inc_pending(leaf_b, &res(&[("cpu", 20)]));

        let mut snapshot = PreemptionContext::from_cluster(&cluster);
        let partition_snapshot = snapshot.partition_mut("default").unwrap();
        DrfPreemptionPolicy.compute(partition_snapshot);

        // both fit: each ideal covers its full demand, nothing preemptable
        let a = partition_snapshot.leaf("root.a").unwrap().resources();
        let b = partition_snapshot.leaf("root.b").unwrap().resources();
        assert_eq!(a.ideal, res(&[("cpu", 80)]));
        assert_eq!(b.ideal, res(&[("cpu", 20), ("mem", 20)]));
        assert!(a.preemptable.is_zero());
        assert!(b.preemptable.is_zero());
    }
}
