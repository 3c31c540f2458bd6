//! Per-queue mutable state: pending heap, observers, wakeable slot

use std::sync::Arc;

use super::task::{Deadline, TaskHeap};

/// Persistent observer callback, invoked on every drain cycle of its
/// queue until explicitly removed.
pub type ObserverClosure = Arc<dyn Fn() + Send + Sync + 'static>;

/// Notification seam between the registry and a queue's driving thread
///
/// A run loop registers one of these per queue; the registry invokes it
/// on every task registration with the current minimum deadline across
/// the queue's pending tasks, and on merge/unmerge transitions. The
/// callee must tolerate wake-ups that do not move its deadline.
pub trait Wakeable: Send + Sync {
    /// Reschedule the next wake-up to at most `when`
    fn wake_up(&self, when: Deadline);
}

/// Mutable state of one logical queue
///
/// Lives behind the registry-wide mutex; exactly one exists per
/// [`TaskQueueId`](super::TaskQueueId) for the process lifetime. While
/// the queue is subsumed by another, this state stays allocated but
/// dormant.
pub(crate) struct QueueState {
    /// Pending tasks, earliest `(deadline, order)` first
    pub(crate) delayed: TaskHeap,

    /// Observers in registration order, keyed by caller-chosen opaque key
    pub(crate) observers: Vec<(u64, ObserverClosure)>,

    /// The driving thread's wake-up hook, if one is installed
    pub(crate) wakeable: Option<Arc<dyn Wakeable>>,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self {
            delayed: TaskHeap::new(),
            observers: Vec::new(),
            wakeable: None,
        }
    }

    /// Earliest pending deadline, `None` when the queue is idle
    pub(crate) fn next_deadline(&self) -> Option<Deadline> {
        self.delayed.peek().map(|task| task.deadline())
    }
}
