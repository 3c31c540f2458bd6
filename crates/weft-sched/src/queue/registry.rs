//! Process-wide task queue registry
//!
//! Owns every queue's state, the global registration sequence, and the
//! merge map that lets one physical thread temporarily service two
//! logical queues. A single registry-wide mutex guards all of it so
//! merge-map resolution and the queue-state mutation it gates appear
//! atomic to concurrent callers; user callbacks (tasks, observers,
//! wakeables) are always invoked with that lock released.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::state::{ObserverClosure, QueueState, Wakeable};
use super::task::{Deadline, DelayedTask, DrainMode, TaskClosure, TaskQueueId};

/// Errors from the merge/unmerge surface
///
/// Every variant is a checked precondition violation; no-op conditions
/// (re-merging an installed pair, removing an absent observer) never
/// produce one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// A queue cannot subsume itself
    #[error("queue {0:?} cannot be merged with itself")]
    SelfMerge(TaskQueueId),

    /// The subordinate is already subsumed by a different owner
    #[error("queue {0:?} is already subsumed by queue {1:?}")]
    AlreadySubsumed(TaskQueueId, TaskQueueId),

    /// The subordinate currently owns a third queue (merges stay flat)
    #[error("queue {0:?} currently owns another queue")]
    SubordinateIsOwner(TaskQueueId),

    /// The would-be owner is itself subsumed (merges stay flat)
    #[error("queue {0:?} is itself subsumed by another queue")]
    OwnerIsSubsumed(TaskQueueId),

    /// The subordinate still has pending tasks; merge only at a
    /// quiescent frame boundary
    #[error("queue {0:?} still has pending tasks")]
    SubordinateNotDrained(TaskQueueId),

    /// Unmerge was called for an owner with no subsumed queue
    #[error("no queue is subsumed by queue {0:?}")]
    NotMerged(TaskQueueId),
}

struct RegistryInner {
    /// One entry per created queue, never removed
    queues: FxHashMap<TaskQueueId, QueueState>,

    /// Subordinate id -> owner id; depth is at most one
    merged: FxHashMap<TaskQueueId, TaskQueueId>,

    /// Next queue id to mint
    next_queue_id: u64,

    /// Global registration sequence; assigned under the lock so
    /// sequence order is registration order even across threads
    next_order: u64,
}

impl RegistryInner {
    /// Follow the merge map to the queue that currently services `id`
    fn resolve(&self, id: TaskQueueId) -> TaskQueueId {
        self.merged.get(&id).copied().unwrap_or(id)
    }

    fn state(&self, id: TaskQueueId) -> &QueueState {
        self.queues.get(&id).expect("task queue id is not registered")
    }

    fn state_mut(&mut self, id: TaskQueueId) -> &mut QueueState {
        self.queues
            .get_mut(&id)
            .expect("task queue id is not registered")
    }

    /// Reverse lookup: the subordinate currently mapping to `owner`
    fn subordinate_of(&self, owner: TaskQueueId) -> Option<TaskQueueId> {
        self.merged
            .iter()
            .find(|(_, o)| **o == owner)
            .map(|(subordinate, _)| *subordinate)
    }
}

/// Registry of all task queues in the process
///
/// Constructed once at startup and shared by reference with every run
/// loop and every [`ThreadMerger`](crate::ThreadMerger); there is no
/// global accessor. Ids addressed to a registry that did not mint them
/// are a caller logic error and panic.
pub struct TaskQueueRegistry {
    inner: Mutex<RegistryInner>,
}

impl TaskQueueRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                queues: FxHashMap::default(),
                merged: FxHashMap::default(),
                next_queue_id: 1,
                next_order: 0,
            }),
        }
    }

    /// Create a new queue; never fails, ids are never reused
    pub fn create_queue(&self) -> TaskQueueId {
        let mut inner = self.inner.lock();
        let id = TaskQueueId::new(inner.next_queue_id);
        inner.next_queue_id += 1;
        inner.queues.insert(id, QueueState::new());
        debug!(queue = id.as_u64(), "created task queue");
        id
    }

    /// Register a one-shot task against `queue_id`
    ///
    /// Resolves through the merge map, assigns the next global sequence
    /// number, and inserts into the servicing queue's heap. If that
    /// queue has a wakeable installed it is invoked synchronously,
    /// within this call, with the current minimum deadline across all
    /// of the queue's pending tasks; this fires on every registration,
    /// whether or not the minimum moved.
    pub fn register_task<F>(&self, queue_id: TaskQueueId, callback: F, deadline: Deadline)
    where
        F: FnOnce() + Send + 'static,
    {
        let (wakeable, wake_at) = {
            let mut inner = self.inner.lock();
            let servicer = inner.resolve(queue_id);
            let order = inner.next_order;
            inner.next_order += 1;
            let state = inner.state_mut(servicer);
            state
                .delayed
                .push(DelayedTask::new(order, deadline, Box::new(callback)));
            // The just-inserted task is not necessarily the soonest.
            let wake_at = state.next_deadline().unwrap_or(deadline);
            (state.wakeable.clone(), wake_at)
        };
        // Invoked outside the lock: the wakeable may re-enter the
        // registry (e.g. to query its deadline) without deadlocking.
        if let Some(wakeable) = wakeable {
            wakeable.wake_up(wake_at);
        }
    }

    /// Remove and return every currently due task's callback, in
    /// `(deadline, order)` order
    ///
    /// Ownership of the callbacks transfers to the caller, which must
    /// invoke them after this call returns; draining never runs user
    /// code under the registry lock, so a running task can re-enter
    /// registration or merge operations freely. An empty result is a
    /// normal outcome.
    pub fn ready_tasks(&self, queue_id: TaskQueueId, mode: DrainMode) -> Vec<TaskClosure> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let servicer = inner.resolve(queue_id);
        let state = inner.state_mut(servicer);

        let mut ready = Vec::new();
        while let Some(task) = state.delayed.peek() {
            if !task.deadline().is_due(now) {
                break;
            }
            ready.push(state.delayed.pop().unwrap().into_callback());
            if mode == DrainMode::Single {
                break;
            }
        }
        ready
    }

    /// Number of pending tasks on the queue servicing `queue_id`
    pub fn pending_task_count(&self, queue_id: TaskQueueId) -> usize {
        let inner = self.inner.lock();
        let servicer = inner.resolve(queue_id);
        inner.state(servicer).delayed.len()
    }

    /// Whether the queue servicing `queue_id` has any pending tasks
    pub fn has_pending_tasks(&self, queue_id: TaskQueueId) -> bool {
        self.pending_task_count(queue_id) > 0
    }

    /// Earliest pending deadline on the queue servicing `queue_id`
    pub(crate) fn next_deadline(&self, queue_id: TaskQueueId) -> Option<Deadline> {
        let inner = self.inner.lock();
        let servicer = inner.resolve(queue_id);
        inner.state(servicer).next_deadline()
    }

    /// Install `queue_id`'s wakeable; the last write wins
    ///
    /// Deliberately not resolved through the merge map: the wakeable
    /// belongs to the physical queue state. A subsumed queue's thread
    /// goes quiet simply because registrations addressed to it are
    /// delivered to the owner's wakeable instead.
    pub fn set_wakeable(&self, queue_id: TaskQueueId, wakeable: Arc<dyn Wakeable>) {
        let mut inner = self.inner.lock();
        inner.state_mut(queue_id).wakeable = Some(wakeable);
    }

    /// Add a persistent observer under `key`; re-using a key replaces
    /// the previous observer
    pub fn add_observer<F>(&self, queue_id: TaskQueueId, key: u64, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let servicer = inner.resolve(queue_id);
        let state = inner.state_mut(servicer);
        state.observers.retain(|(k, _)| *k != key);
        state.observers.push((key, Arc::new(observer)));
    }

    /// Remove the observer under `key`; removing an absent key is a
    /// silent no-op
    pub fn remove_observer(&self, queue_id: TaskQueueId, key: u64) {
        let mut inner = self.inner.lock();
        let servicer = inner.resolve(queue_id);
        inner
            .state_mut(servicer)
            .observers
            .retain(|(k, _)| *k != key);
    }

    /// Invoke every observer of the queue servicing `queue_id`, in
    /// registration order, outside the registry lock
    pub fn notify_observers(&self, queue_id: TaskQueueId) {
        let observers: Vec<ObserverClosure> = {
            let inner = self.inner.lock();
            let servicer = inner.resolve(queue_id);
            inner
                .state(servicer)
                .observers
                .iter()
                .map(|(_, observer)| observer.clone())
                .collect()
        };
        for observer in observers {
            observer();
        }
    }

    /// Redirect all scheduling operations for `subordinate` to `owner`
    ///
    /// Idempotent on the already-installed pair. Fails when the pair
    /// would violate the flat-merge invariant (no chains, no queue that
    /// is both owner and subordinate) or when the subordinate still has
    /// pending tasks; callers merge only at a quiescent frame boundary.
    /// On success the owner's wakeable is kicked so its loop
    /// re-evaluates its deadline.
    pub fn merge(&self, owner: TaskQueueId, subordinate: TaskQueueId) -> Result<(), MergeError> {
        let (wakeable, wake_at) = {
            let mut inner = self.inner.lock();
            if owner == subordinate {
                return Err(MergeError::SelfMerge(owner));
            }
            match inner.merged.get(&subordinate) {
                Some(current) if *current == owner => return Ok(()),
                Some(current) => {
                    return Err(MergeError::AlreadySubsumed(subordinate, *current));
                }
                None => {}
            }
            if inner.subordinate_of(subordinate).is_some() {
                return Err(MergeError::SubordinateIsOwner(subordinate));
            }
            if inner.merged.contains_key(&owner) {
                return Err(MergeError::OwnerIsSubsumed(owner));
            }
            if !inner.state(subordinate).delayed.is_empty() {
                return Err(MergeError::SubordinateNotDrained(subordinate));
            }
            inner.merged.insert(subordinate, owner);
            debug!(
                owner = owner.as_u64(),
                subordinate = subordinate.as_u64(),
                "task queues merged"
            );
            let state = inner.state(owner);
            (
                state.wakeable.clone(),
                state.next_deadline().unwrap_or(Deadline::Never),
            )
        };
        if let Some(wakeable) = wakeable {
            wakeable.wake_up(wake_at);
        }
        Ok(())
    }

    /// Detach whichever subordinate currently maps to `owner`
    ///
    /// Fails with [`MergeError::NotMerged`] when no queue is subsumed
    /// by `owner`. On success the subordinate's own wakeable is invoked
    /// with its current minimum deadline (`Never` when idle) so its
    /// parked thread resumes its run loop.
    pub fn unmerge(&self, owner: TaskQueueId) -> Result<(), MergeError> {
        let (wakeable, wake_at) = {
            let mut inner = self.inner.lock();
            let subordinate = inner
                .subordinate_of(owner)
                .ok_or(MergeError::NotMerged(owner))?;
            inner.merged.remove(&subordinate);
            debug!(
                owner = owner.as_u64(),
                subordinate = subordinate.as_u64(),
                "task queues unmerged"
            );
            let state = inner.state(subordinate);
            (
                state.wakeable.clone(),
                state.next_deadline().unwrap_or(Deadline::Never),
            )
        };
        if let Some(wakeable) = wakeable {
            wakeable.wake_up(wake_at);
        }
        Ok(())
    }

    /// Whether `subordinate` currently maps to `owner`
    pub fn owns(&self, owner: TaskQueueId, subordinate: TaskQueueId) -> bool {
        let inner = self.inner.lock();
        inner.merged.get(&subordinate) == Some(&owner)
    }

    /// Whether `queue_id` is currently subsumed by another queue
    ///
    /// Run loops use this to park instead of draining while their queue
    /// is merged away.
    pub fn is_subsumed(&self, queue_id: TaskQueueId) -> bool {
        self.inner.lock().merged.contains_key(&queue_id)
    }
}

impl Default for TaskQueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}
