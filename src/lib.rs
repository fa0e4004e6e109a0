//! camgraph: a processing-graph engine for camera frame pipelines.
//!
//! camgraph turns a declarative [`GraphPolicy`](graph::GraphPolicy) into a
//! running pipeline of stages connected by typed ports. Each stage owns
//! per-port buffer FIFOs and a kernel chain; frames are submitted as tasks
//! whose buffers flow through the graph, and completions, statistics, and
//! output frames come back through observer callbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use camgraph::core::{PassthroughFactory, SessionContext};
//! use camgraph::graph::{GraphBuilder, GraphPolicy};
//!
//! # fn main() -> Result<(), camgraph::core::CamGraphError> {
//! let policy = GraphPolicy::from_toml_file("pipeline.toml")?;
//! let ctx = Arc::new(SessionContext::new(0));
//! let graph = GraphBuilder::build(&policy, &PassthroughFactory, ctx)?;
//! graph.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`core`]: ports, pixel formats, buffers, kernels, errors, session knobs
//! - [`graph`]: policies, terminal resolution, and the atomic builder
//! - [`sync`]: bundle barriers and the cooperative trigger scheduler
//! - [`execution`]: stage queues, task registry, raw retention, and the
//!   frame processor with drained tuning-mode swaps

pub mod core;
pub mod execution;
pub mod graph;
pub mod sync;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::core::{
        BranchPrecedence, CamGraphError, CamGraphResult, FrameBuffer, FrameUsage, KernelFactory,
        PassthroughFactory, PassthroughKernel, PixelFormat, Port, PortBufferMap, SequenceId,
        SessionContext, StageKernel, StreamConfig, StreamId, StreamKind, TuningMode,
    };
    pub use crate::execution::{
        FrameProcessor, FrameRequest, GraphObserver, PipelineGraph, SettingsProvider, TaskData,
    };
    pub use crate::graph::{GraphBuilder, GraphPolicy};
    pub use crate::sync::{BundleBarrier, TriggerScheduler, WaitOutcome};
}

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_is_set() {
        assert!(!super::VERSION.is_empty());
    }
}
