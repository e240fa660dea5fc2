//! Scheduling Applications and Allocation Asks
//!
//! An application lives in exactly one leaf queue and owns a set of
//! outstanding asks, each a request for N identical allocations of a given
//! resource shape. The application tracks the aggregate pending demand of
//! its asks; the queue tree propagates every pending change up to the root.

use std::collections::HashMap;

use crate::queue::QueueId;
use crate::resources::Resource;
use crate::{ApplicationId, SchedulerError};

/// A request for `remaining_repeat` identical allocations of `resource`.
#[derive(Debug, Clone)]
pub struct AllocationAsk {
    pub allocation_key: String,
    pub application_id: ApplicationId,
    pub resource: Resource,
    pub remaining_repeat: u32,
}

impl AllocationAsk {
    pub fn new(
        allocation_key: impl Into<String>,
        application_id: impl Into<String>,
        resource: Resource,
        remaining_repeat: u32,
    ) -> Self {
        AllocationAsk {
            allocation_key: allocation_key.into(),
            application_id: application_id.into(),
            resource,
            remaining_repeat,
        }
    }

    /// Total outstanding demand of this ask: `resource × remaining_repeat`.
    pub fn total(&self) -> Resource {
        self.resource.multiply(self.remaining_repeat as u64)
    }
}

/// Direction and size of a pending change produced by ask bookkeeping.
/// The owning queue tree applies it along the leaf-to-root chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    Increased(Resource),
    Decreased(Resource),
    Unchanged,
}

/// Per-application scheduling state.
#[derive(Debug, Clone)]
pub struct SchedulingApp {
    id: ApplicationId,
    queue: QueueId,
    submission_seq: u64,
    started: bool,
    asks: HashMap<String, AllocationAsk>,
    pending: Resource,
}

impl SchedulingApp {
    /// New application in the given leaf. The submission sequence number is
    /// assigned by the partition and drives the FIFO ordering policies.
    pub fn new(id: impl Into<String>, queue: QueueId, submission_seq: u64) -> Self {
        SchedulingApp {
            id: id.into(),
            queue,
            submission_seq,
            started: false,
            asks: HashMap::new(),
            pending: Resource::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn submission_seq(&self) -> u64 {
        self.submission_seq
    }

    /// Whether the scheduler has ever proposed an allocation for this app.
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Aggregate outstanding demand across all asks.
    pub fn pending(&self) -> &Resource {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_zero()
    }

    pub fn ask(&self, allocation_key: &str) -> Option<&AllocationAsk> {
        self.asks.get(allocation_key)
    }

    /// Ask keys in deterministic order.
    pub fn sorted_ask_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.asks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Add or replace an ask.
    ///
    /// Replacing an existing key first retracts the old ask's total demand,
    /// then adds the new one; the returned change is what the queue chain
    /// must apply. The two-sided form avoids signed arithmetic on the
    /// unsigned resource vectors.
    pub fn add_ask(&mut self, ask: AllocationAsk) -> (Option<Resource>, Resource) {
        let removed = self
            .asks
            .insert(ask.allocation_key.clone(), ask.clone())
            .map(|old| old.total());
        let added = ask.total();
        if let Some(old_total) = &removed {
            self.pending.sub_assign_saturating(old_total);
        }
        self.pending.add_assign(&added);
        (removed, added)
    }

    /// Update an ask's repeat count by a signed delta.
    ///
    /// The new repeat clamps at zero; at zero the ask is removed. Unknown
    /// keys are reported to the caller.
    pub fn update_ask_repeat(
        &mut self,
        allocation_key: &str,
        delta: i64,
    ) -> Result<PendingChange, SchedulerError> {
        let ask = self
            .asks
            .get_mut(allocation_key)
            .ok_or_else(|| SchedulerError::not_found("allocation ask", allocation_key))?;

        let old_repeat = ask.remaining_repeat as i64;
        let new_repeat = (old_repeat + delta).max(0);
        let change = match new_repeat - old_repeat {
            0 => PendingChange::Unchanged,
            units if units > 0 => {
                let gained = ask.resource.multiply(units as u64);
                self.pending.add_assign(&gained);
                PendingChange::Increased(gained)
            }
            units => {
                let released = ask.resource.multiply((-units) as u64);
                self.pending.sub_assign_saturating(&released);
                PendingChange::Decreased(released)
            }
        };

        if new_repeat == 0 {
            self.asks.remove(allocation_key);
        } else {
            ask.remaining_repeat = new_repeat as u32;
        }
        Ok(change)
    }

    /// Drop an ask outright, returning its outstanding total.
    pub fn remove_ask(&mut self, allocation_key: &str) -> Option<Resource> {
        let removed = self.asks.remove(allocation_key).map(|ask| ask.total());
        if let Some(total) = &removed {
            self.pending.sub_assign_saturating(total);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(entries: &[(&str, u64)]) -> Resource {
        Resource::from_map(entries.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    fn app() -> SchedulingApp {
        SchedulingApp::new("app-1", QueueId::for_tests(0), 0)
    }

    #[test]
    fn test_add_ask_accumulates_pending() {
        let mut app = app();
        let (removed, added) =
            app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 1)]), 3));
        assert!(removed.is_none());
        assert_eq!(added, res(&[("first", 3)]));
        assert_eq!(app.pending(), &res(&[("first", 3)]));
    }

    #[test]
    fn test_add_ask_replace_same_key() {
        let mut app = app();
        app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 2)]), 2));
        let (removed, added) =
            app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 1)]), 1));
        assert_eq!(removed, Some(res(&[("first", 4)])));
        assert_eq!(added, res(&[("first", 1)]));
        assert_eq!(app.pending(), &res(&[("first", 1)]));
    }

    #[test]
    fn test_update_repeat_down_to_zero_removes_ask() {
        let mut app = app();
        app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 1)]), 1));
        let change = app.update_ask_repeat("alloc-1", -1).unwrap();
        assert_eq!(change, PendingChange::Decreased(res(&[("first", 1)])));
        assert!(app.ask("alloc-1").is_none());
        assert!(!app.has_pending());
    }

    #[test]
    fn test_update_repeat_clamps_below_zero() {
        let mut app = app();
        app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 1)]), 2));
        // -5 clamps to zero, releasing only the two outstanding repeats
        let change = app.update_ask_repeat("alloc-1", -5).unwrap();
        assert_eq!(change, PendingChange::Decreased(res(&[("first", 2)])));
        assert!(app.ask("alloc-1").is_none());
    }

    #[test]
    fn test_update_repeat_unknown_key() {
        let mut app = app();
        let err = app.update_ask_repeat("nope", 1).unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }

    #[test]
    fn test_update_repeat_up() {
        let mut app = app();
        app.add_ask(AllocationAsk::new("alloc-1", "app-1", res(&[("first", 1)]), 1));
        let change = app.update_ask_repeat("alloc-1", 2).unwrap();
        assert_eq!(change, PendingChange::Increased(res(&[("first", 2)])));
        assert_eq!(app.ask("alloc-1").unwrap().remaining_repeat, 3);
    }
}
