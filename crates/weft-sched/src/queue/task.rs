//! Task queue identifiers, deadlines, and pending-task heap entries

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Boxed one-shot task callback, handed to the registry at registration
/// and back to the draining run loop.
pub type TaskClosure = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a logical task queue
///
/// Ids are minted by [`TaskQueueRegistry::create_queue`] and are never
/// reused; a queue lives for the rest of the process.
///
/// [`TaskQueueRegistry::create_queue`]: super::TaskQueueRegistry::create_queue
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskQueueId(u64);

impl TaskQueueId {
    pub(crate) fn new(raw: u64) -> Self {
        TaskQueueId(raw)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// When a registered task becomes eligible to run
///
/// `Never` is orderable like any other deadline but is never due on its
/// own; `Now` is always due. The derived ordering is
/// `Now < At(..) < Never`, with finite instants compared between
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// Eligible immediately
    Now,
    /// Eligible once the instant has passed
    At(Instant),
    /// Never eligible on its own (still drains last if forced)
    Never,
}

impl Deadline {
    /// Deadline `delay` from the current instant
    pub fn after(delay: Duration) -> Self {
        Deadline::At(Instant::now() + delay)
    }

    /// Whether a task with this deadline is eligible to run at `now`
    pub fn is_due(self, now: Instant) -> bool {
        match self {
            Deadline::Now => true,
            Deadline::At(when) => when <= now,
            Deadline::Never => false,
        }
    }
}

/// How much ready work a single drain call hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Everything currently due, in order (the normal run-loop mode)
    All,
    /// At most one due task (diagnostic/testing use)
    Single,
}

/// One pending task: callback, deadline, and global registration order
pub(crate) struct DelayedTask {
    deadline: Deadline,
    order: u64,
    callback: TaskClosure,
}

impl DelayedTask {
    pub(crate) fn new(order: u64, deadline: Deadline, callback: TaskClosure) -> Self {
        Self {
            deadline,
            order,
            callback,
        }
    }

    pub(crate) fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub(crate) fn into_callback(self) -> TaskClosure {
        self.callback
    }
}

// Reverse ordering for min-heap (earliest deadline first, then lowest
// registration order as the cross-thread tie-break).
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.order).cmp(&(self.deadline, self.order))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl Eq for DelayedTask {}

/// Min-heap of pending tasks keyed by `(deadline, order)`
pub(crate) type TaskHeap = BinaryHeap<DelayedTask>;
