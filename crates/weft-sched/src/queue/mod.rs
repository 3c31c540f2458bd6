//! Cross-thread task queues
//!
//! One logical queue per managed OS thread, a process-wide registry of
//! their state, and the merge map that lets one physical thread
//! temporarily service two queues.

mod registry;
mod state;
mod task;

pub use registry::{MergeError, TaskQueueRegistry};
pub use state::{ObserverClosure, Wakeable};
pub use task::{Deadline, DrainMode, TaskClosure, TaskQueueId};
