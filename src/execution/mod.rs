//! Runtime execution: stage queues, task tracking, retention, and dispatch.

pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod retention;

pub use pipeline::{GraphObserver, PipelineGraph, PortMapping, SettingsProvider};
pub use processor::{FrameProcessor, FrameRequest};
pub use queue::{FrameSink, StageQueue};
pub use registry::{TaskData, TaskRegistry};
pub use retention::{RawFrame, RawRetention};
