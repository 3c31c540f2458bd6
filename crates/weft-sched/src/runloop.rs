//! Per-thread run loop
//!
//! Each managed thread drives one queue: wait until the next deadline
//! or an explicit kick, drain ready tasks, invoke observers, recompute,
//! sleep again. While the queue is subsumed by a merge the loop parks
//! and the unmerge-time wake rouses it.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::queue::{Deadline, DrainMode, TaskQueueId, TaskQueueRegistry, Wakeable};

thread_local! {
    static BOUND_QUEUE: Cell<Option<TaskQueueId>> = const { Cell::new(None) };
}

/// The queue the calling thread is currently servicing, if any
///
/// Set by [`RunLoop::run`] for its own thread, or manually via
/// [`ThreadBinding`] by embedders that drive draining themselves.
pub fn current_queue() -> Option<TaskQueueId> {
    BOUND_QUEUE.with(|bound| bound.get())
}

/// RAII binding of the calling thread to a queue id
///
/// Restores the previous binding (if any) when dropped, so nested
/// bindings behave like a stack. Not sendable: the binding is a
/// property of the thread that created it.
pub struct ThreadBinding {
    previous: Option<TaskQueueId>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadBinding {
    /// Bind the calling thread to `queue_id` until the guard drops
    pub fn bind(queue_id: TaskQueueId) -> Self {
        let previous = BOUND_QUEUE.with(|bound| bound.replace(Some(queue_id)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        BOUND_QUEUE.with(|bound| bound.set(self.previous));
    }
}

struct WakeState {
    /// Earliest requested wake-up
    next_wake: Deadline,
}

struct RunLoopInner {
    state: Mutex<WakeState>,
    notify: Condvar,
    terminated: AtomicBool,
}

impl Wakeable for RunLoopInner {
    fn wake_up(&self, when: Deadline) {
        let mut state = self.state.lock();
        if when < state.next_wake {
            state.next_wake = when;
        }
        // Kick unconditionally: the loop re-evaluates cheaply when the
        // deadline has not actually moved.
        self.notify.notify_one();
    }
}

/// Run loop driving one task queue on one OS thread
///
/// Creates its own queue and installs itself as that queue's wakeable.
/// [`run`](Self::run) executes on the embedder's thread;
/// [`terminate`](Self::terminate) may be called from any thread.
pub struct RunLoop {
    registry: Arc<TaskQueueRegistry>,
    queue_id: TaskQueueId,
    inner: Arc<RunLoopInner>,
}

impl RunLoop {
    /// Create a run loop with a fresh queue on `registry`
    pub fn new(registry: Arc<TaskQueueRegistry>) -> Arc<Self> {
        let queue_id = registry.create_queue();
        let inner = Arc::new(RunLoopInner {
            state: Mutex::new(WakeState {
                next_wake: Deadline::Never,
            }),
            notify: Condvar::new(),
            terminated: AtomicBool::new(false),
        });
        registry.set_wakeable(queue_id, inner.clone());
        Arc::new(Self {
            registry,
            queue_id,
            inner,
        })
    }

    /// The queue this loop drains
    pub fn queue_id(&self) -> TaskQueueId {
        self.queue_id
    }

    /// Drive the queue on the calling thread until terminated
    ///
    /// Binds the thread to the queue id for the duration, so
    /// [`current_queue`] answers correctly from inside task callbacks.
    pub fn run(&self) {
        let _binding = ThreadBinding::bind(self.queue_id);
        debug!(queue = self.queue_id.as_u64(), "run loop started");

        while !self.inner.terminated.load(Ordering::Acquire) {
            if self.registry.is_subsumed(self.queue_id) {
                // Parked while merged away; the unmerge-time wake (or
                // terminate) rouses us.
                let mut state = self.inner.state.lock();
                if self.inner.terminated.load(Ordering::Acquire) {
                    break;
                }
                if self.registry.is_subsumed(self.queue_id) {
                    self.inner.notify.wait(&mut state);
                }
                continue;
            }

            let tasks = self.registry.ready_tasks(self.queue_id, DrainMode::All);
            for task in tasks {
                task();
            }
            self.registry.notify_observers(self.queue_id);

            let mut state = self.inner.state.lock();
            if self.inner.terminated.load(Ordering::Acquire) {
                break;
            }
            // Recompute from the queue itself rather than trusting the
            // accumulated kicks: anything registered during the drain
            // is already reflected in the queue's minimum.
            state.next_wake = self
                .registry
                .next_deadline(self.queue_id)
                .unwrap_or(Deadline::Never);
            match state.next_wake {
                Deadline::Now => {}
                Deadline::At(when) => {
                    self.inner.notify.wait_until(&mut state, when);
                }
                Deadline::Never => {
                    self.inner.notify.wait(&mut state);
                }
            }
        }

        debug!(queue = self.queue_id.as_u64(), "run loop terminated");
    }

    /// Stop the loop; callable from any thread, idempotent
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        // Taking the lock serializes with a loop that has decided to
        // wait but not yet released the mutex, closing the lost-wake
        // window.
        let _state = self.inner.state.lock();
        self.inner.notify.notify_all();
    }
}
