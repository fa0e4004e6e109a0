//! Core types shared by the graph builder and the execution engine.

pub mod buffer;
pub mod context;
pub mod error;
pub mod stage;
pub mod types;

pub use buffer::{has_valid_buffers, primary_sequence, BufferId, FrameBuffer, PortBufferMap};
pub use context::{BranchPrecedence, SessionContext, TuningMode};
pub use error::{
    CamGraphError, CamGraphResult, ConfigError, ConfigResult, PipelineError, PipelineResult,
    PolicyError, PolicyResult, StageError, StageResult, TuningError,
};
pub use stage::{KernelFactory, PassthroughFactory, PassthroughKernel, StageKernel};
pub use types::{
    FrameUsage, NotifyOrder, PixelFormat, Port, SequenceId, StreamConfig, StreamId, StreamKind,
};
