//! Lease-counted thread merging
//!
//! A [`ThreadMerger`] coordinates exactly one (primary, secondary)
//! queue pair: while merged, the primary's thread services both queues
//! and the secondary's thread is parked. The merge persists for a lease
//! measured in completed frames, decremented once per frame on the
//! primary thread, and un-fuses automatically when the lease runs out.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::queue::{MergeError, TaskQueueId, TaskQueueRegistry};
use crate::runloop::current_queue;

/// Result of one lease decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The lease is still positive; the queues stay merged
    RemainsMerged,
    /// The merger was not merged to begin with
    RemainsUnmerged,
    /// This decrement exhausted the lease and un-fused the queues
    UnmergedNow,
}

enum MergerState {
    Unmerged,
    /// Lease is always positive while merged
    Merged { lease: usize },
}

/// Coordinator for temporarily fusing two queues onto one thread
///
/// Shared-ownership handle: collaborators hold an `Arc<ThreadMerger>`
/// and release it independently. In practice there is one merger per
/// (primary, secondary) pair for the process lifetime.
pub struct ThreadMerger {
    registry: Arc<TaskQueueRegistry>,
    primary: TaskQueueId,
    secondary: TaskQueueId,
    state: Mutex<MergerState>,
}

impl ThreadMerger {
    /// Create a merger for the (primary, secondary) pair
    ///
    /// `primary` is the queue whose thread keeps running while merged;
    /// `secondary` is the queue whose thread may be suspended. A merge
    /// already installed by another path is observed and adopted with a
    /// one-frame lease; extend it with [`extend_lease_to`].
    ///
    /// [`extend_lease_to`]: Self::extend_lease_to
    pub fn new(
        registry: Arc<TaskQueueRegistry>,
        primary: TaskQueueId,
        secondary: TaskQueueId,
    ) -> Arc<Self> {
        let state = if registry.owns(primary, secondary) {
            MergerState::Merged { lease: 1 }
        } else {
            MergerState::Unmerged
        };
        Arc::new(Self {
            registry,
            primary,
            secondary,
            state: Mutex::new(state),
        })
    }

    /// The queue whose thread keeps running while merged
    pub fn primary_queue(&self) -> TaskQueueId {
        self.primary
    }

    /// The queue whose thread is parked while merged
    pub fn secondary_queue(&self) -> TaskQueueId {
        self.secondary
    }

    /// Merge the pair with a lease of `term` frames
    ///
    /// A no-op when already merged: the existing lease is neither reset
    /// nor extended (use [`extend_lease_to`] for that). `term` must be
    /// positive.
    ///
    /// [`extend_lease_to`]: Self::extend_lease_to
    pub fn merge_with_lease(&self, term: usize) -> Result<(), MergeError> {
        assert!(term > 0, "lease term must be positive");
        let mut state = self.state.lock();
        if let MergerState::Merged { .. } = *state {
            return Ok(());
        }
        self.registry.merge(self.primary, self.secondary)?;
        *state = MergerState::Merged { lease: term };
        debug!(
            primary = self.primary.as_u64(),
            secondary = self.secondary.as_u64(),
            lease = term,
            "threads merged"
        );
        Ok(())
    }

    /// Stretch the lease to at least `term` frames; never shortens it
    ///
    /// A no-op while unmerged. `term` must be positive.
    pub fn extend_lease_to(&self, term: usize) {
        assert!(term > 0, "lease term must be positive");
        let mut state = self.state.lock();
        if let MergerState::Merged { lease } = *state {
            *state = MergerState::Merged {
                lease: lease.max(term),
            };
        }
    }

    /// Count one completed frame against the lease
    ///
    /// Call once per completed unit of work on the primary thread. When
    /// the lease reaches zero the queues are un-fused; the registry's
    /// unmerge cannot fail at that point because this merger's own
    /// bookkeeping guarantees the mapping exists.
    pub fn decrement_lease(&self) -> LeaseStatus {
        let mut state = self.state.lock();
        match *state {
            MergerState::Unmerged => LeaseStatus::RemainsUnmerged,
            MergerState::Merged { lease } => {
                let lease = lease - 1;
                if lease == 0 {
                    self.registry
                        .unmerge(self.primary)
                        .expect("merge mapping must exist while the merger holds a lease");
                    *state = MergerState::Unmerged;
                    debug!(
                        primary = self.primary.as_u64(),
                        secondary = self.secondary.as_u64(),
                        "lease expired, threads unmerged"
                    );
                    LeaseStatus::UnmergedNow
                } else {
                    *state = MergerState::Merged { lease };
                    LeaseStatus::RemainsMerged
                }
            }
        }
    }

    /// Whether the pair is currently merged
    pub fn is_merged(&self) -> bool {
        matches!(*self.state.lock(), MergerState::Merged { .. })
    }

    /// Whether the calling thread is the one allowed to rasterize now
    ///
    /// Compares the calling thread's bound queue against the primary
    /// while merged and against the secondary while unmerged, so code
    /// can ask "may I do raster-thread-only work here?" without knowing
    /// the merge state itself.
    pub fn is_on_rasterizing_thread(&self) -> bool {
        let rasterizing = if self.is_merged() {
            self.primary
        } else {
            self.secondary
        };
        current_queue() == Some(rasterizing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runloop::ThreadBinding;

    fn pair() -> (Arc<TaskQueueRegistry>, TaskQueueId, TaskQueueId) {
        let registry = Arc::new(TaskQueueRegistry::new());
        let primary = registry.create_queue();
        let secondary = registry.create_queue();
        (registry, primary, secondary)
    }

    #[test]
    fn test_starts_unmerged() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry.clone(), primary, secondary);

        assert!(!merger.is_merged());
        assert!(!registry.owns(primary, secondary));
        assert_eq!(merger.primary_queue(), primary);
        assert_eq!(merger.secondary_queue(), secondary);
    }

    #[test]
    fn test_lease_countdown() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry.clone(), primary, secondary);

        merger.merge_with_lease(2).unwrap();
        assert!(merger.is_merged());
        assert!(registry.owns(primary, secondary));

        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsMerged);
        assert!(merger.is_merged());
        assert_eq!(merger.decrement_lease(), LeaseStatus::UnmergedNow);
        assert!(!merger.is_merged());
        assert!(!registry.owns(primary, secondary));
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsUnmerged);
    }

    #[test]
    fn test_merge_with_lease_does_not_reset_existing_lease() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry, primary, secondary);

        merger.merge_with_lease(1).unwrap();
        // Already merged: the larger term is ignored.
        merger.merge_with_lease(10).unwrap();

        assert_eq!(merger.decrement_lease(), LeaseStatus::UnmergedNow);
    }

    #[test]
    fn test_extend_lease() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry, primary, secondary);

        merger.merge_with_lease(2).unwrap();

        // Smaller than the current lease: no-op.
        merger.extend_lease_to(1);
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsMerged);

        // Larger: the merged lifetime stretches accordingly.
        merger.extend_lease_to(3);
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsMerged);
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsMerged);
        assert_eq!(merger.decrement_lease(), LeaseStatus::UnmergedNow);
    }

    #[test]
    fn test_extend_lease_while_unmerged_is_noop() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry, primary, secondary);

        merger.extend_lease_to(5);
        assert!(!merger.is_merged());
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsUnmerged);
    }

    #[test]
    fn test_observes_merge_installed_by_another_path() {
        let (registry, primary, secondary) = pair();
        registry.merge(primary, secondary).unwrap();

        let merger = ThreadMerger::new(registry.clone(), primary, secondary);
        assert!(merger.is_merged());

        // Adopted with a one-frame lease.
        assert_eq!(merger.decrement_lease(), LeaseStatus::UnmergedNow);
        assert!(!registry.owns(primary, secondary));
    }

    #[test]
    fn test_merge_precondition_failure_leaves_state_unmerged() {
        let (registry, primary, secondary) = pair();
        registry.register_task(secondary, || {}, crate::queue::Deadline::Never);

        let merger = ThreadMerger::new(registry, primary, secondary);
        assert_eq!(
            merger.merge_with_lease(2),
            Err(MergeError::SubordinateNotDrained(secondary))
        );
        assert!(!merger.is_merged());
        assert_eq!(merger.decrement_lease(), LeaseStatus::RemainsUnmerged);
    }

    #[test]
    fn test_rasterizing_thread_polarity() {
        let (registry, primary, secondary) = pair();
        let merger = ThreadMerger::new(registry, primary, secondary);

        // Unmerged: the secondary's thread rasterizes.
        {
            let _binding = ThreadBinding::bind(secondary);
            assert!(merger.is_on_rasterizing_thread());
        }
        {
            let _binding = ThreadBinding::bind(primary);
            assert!(!merger.is_on_rasterizing_thread());
        }
        // No binding at all: never the rasterizing thread.
        assert!(!merger.is_on_rasterizing_thread());

        merger.merge_with_lease(1).unwrap();

        // Merged: the polarity flips.
        {
            let _binding = ThreadBinding::bind(primary);
            assert!(merger.is_on_rasterizing_thread());
        }
        {
            let _binding = ThreadBinding::bind(secondary);
            assert!(!merger.is_on_rasterizing_thread());
        }
    }
}
