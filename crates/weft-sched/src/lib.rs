//! Weft scheduling core
//!
//! This crate provides the cross-thread scheduling layer of the engine:
//! - Task queues: one logical queue per managed OS thread, accepting
//!   time-ordered deferred work from any thread
//! - A process-wide registry with wake-on-register notification
//! - Dynamic thread merging: two queues temporarily fused so one
//!   physical thread services both, with lease-counted un-fusing
//! - A condvar-driven run loop for driving a queue on its thread
//!
//! The registry is an explicit, dependency-injected object: construct
//! one [`TaskQueueRegistry`] at startup and share it by `Arc` with
//! every [`RunLoop`] and [`ThreadMerger`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod merger;
pub mod queue;
pub mod runloop;

pub use merger::{LeaseStatus, ThreadMerger};
pub use queue::{
    Deadline, DrainMode, MergeError, ObserverClosure, TaskClosure, TaskQueueId, TaskQueueRegistry,
    Wakeable,
};
pub use runloop::{current_queue, RunLoop, ThreadBinding};
