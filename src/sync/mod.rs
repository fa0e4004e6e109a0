//! Synchronization primitives: bundle barriers and the trigger scheduler.

pub mod barrier;
pub mod scheduler;

pub use barrier::{BundleBarrier, WaitOutcome};
pub use scheduler::{SchedulerNode, TriggerScheduler};
