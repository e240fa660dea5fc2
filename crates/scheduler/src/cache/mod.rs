//! Cache-Layer Queue Record
//!
//! `QueueInfo` is the configuration-facing half of a queue: name and path,
//! managed/dynamic kind, parent/leaf role, the lifecycle state machine, the
//! configured guaranteed and max resources, and the allocations confirmed by
//! the resource manager. The scheduling-side counters (pending, allocating,
//! preempting) live on the queue tree node that embeds this record.

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::resources::Resource;
use crate::SchedulerError;

/// How a queue came to exist.
///
/// Managed queues are declared in configuration and survive restarts.
/// Dynamic queues are created on first application submission and are
/// eligible for automatic removal once empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Managed,
    Dynamic,
}

/// Position of a queue in the tree. A leaf holds applications; a parent
/// holds child queues. A queue never changes role during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Parent,
    Leaf,
}

/// Queue lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Stopped,
    Draining,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Running => write!(f, "running"),
            QueueState::Stopped => write!(f, "stopped"),
            QueueState::Draining => write!(f, "draining"),
        }
    }
}

/// Events driving the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Start,
    Stop,
    Remove,
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Start => write!(f, "start"),
            QueueEvent::Stop => write!(f, "stop"),
            QueueEvent::Remove => write!(f, "remove"),
        }
    }
}

/// Cache record of a single queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    name: String,
    path: String,
    kind: QueueKind,
    role: QueueRole,
    state: QueueState,
    guaranteed: Option<Resource>,
    max: Option<Resource>,
    allocated: Resource,
    properties: HashMap<String, String>,
}

impl QueueInfo {
    /// New managed queue in the `Running` state.
    pub fn managed(
        name: impl Into<String>,
        path: impl Into<String>,
        role: QueueRole,
        guaranteed: Option<Resource>,
        max: Option<Resource>,
        properties: HashMap<String, String>,
    ) -> Self {
        QueueInfo {
            name: name.into(),
            path: path.into(),
            kind: QueueKind::Managed,
            role,
            state: QueueState::Running,
            guaranteed,
            max,
            allocated: Resource::new(),
            properties,
        }
    }

    /// New dynamic queue, created on first application submission. Dynamic
    /// queues carry no configured limits.
    pub fn dynamic(name: impl Into<String>, path: impl Into<String>, role: QueueRole) -> Self {
        QueueInfo {
            name: name.into(),
            path: path.into(),
            kind: QueueKind::Dynamic,
            role,
            state: QueueState::Running,
            guaranteed: None,
            max: None,
            allocated: Resource::new(),
            properties: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == QueueState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == QueueState::Stopped
    }

    pub fn is_draining(&self) -> bool {
        self.state == QueueState::Draining
    }

    pub fn is_managed(&self) -> bool {
        self.kind == QueueKind::Managed
    }

    pub fn is_leaf(&self) -> bool {
        self.role == QueueRole::Leaf
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn guaranteed(&self) -> Option<&Resource> {
        self.guaranteed.as_ref()
    }

    pub fn max(&self) -> Option<&Resource> {
        self.max.as_ref()
    }

    pub fn allocated(&self) -> &Resource {
        &self.allocated
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Drive the lifecycle state machine.
    ///
    /// Draining is terminal: only a repeated `Remove` is accepted there.
    /// Illegal transitions return a state error and leave the state
    /// untouched.
    pub fn handle_event(&mut self, event: QueueEvent) -> Result<(), SchedulerError> {
        let next = match (self.state, event) {
            (QueueState::Draining, QueueEvent::Remove) => QueueState::Draining,
            (QueueState::Draining, _) => {
                return Err(SchedulerError::State {
                    queue: self.path.clone(),
                    state: self.state.to_string(),
                    event: event.to_string(),
                })
            }
            (_, QueueEvent::Start) => QueueState::Running,
            (_, QueueEvent::Stop) => QueueState::Stopped,
            (_, QueueEvent::Remove) => QueueState::Draining,
        };
        if next != self.state {
            debug!(queue = %self.path, from = %self.state, to = %next, "queue state transition");
        }
        self.state = next;
        Ok(())
    }

    /// Add confirmed allocations. With `check_max` set the operation is
    /// rejected when the new total would exceed the configured max; the
    /// counter is left unchanged in that case.
    pub fn inc_allocated(
        &mut self,
        delta: &Resource,
        check_max: bool,
    ) -> Result<(), SchedulerError> {
        let next = self.allocated.add(delta);
        if check_max {
            if let Some(max) = &self.max {
                if !next.fits_in(max) {
                    return Err(SchedulerError::Capacity {
                        queue: self.path.clone(),
                        requested: next.to_string(),
                        limit: max.to_string(),
                    });
                }
            }
        }
        self.allocated = next;
        Ok(())
    }

    /// Release confirmed allocations, clamping at zero.
    pub fn dec_allocated(&mut self, delta: &Resource) {
        self.allocated.sub_assign_saturating(delta);
    }
}
