//! Error taxonomy for the pipeline engine.
//!
//! # Design Philosophy
//!
//! Layered error types mirror the crate layers: policy parsing, graph
//! construction, per-stage transforms, and pipeline-level dispatch each get
//! their own enum, and the crate-level [`CamGraphError`] wraps them with
//! `#[from]` conversions so `?` flows across layers.
//!
//! Only configuration-time errors are fatal. Runtime anomalies (a transform
//! failure, a barrier timeout, a tuning miss) degrade the affected frame and
//! are logged, but never abort the pipeline.

use crate::core::types::{Port, SequenceId, StreamId};
use crate::graph::terminal::TerminalId;
use thiserror::Error;

/// Errors found while reading or validating a declarative graph policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy declares no stages")]
    NoStages,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{0}' declares no kernels")]
    EmptyKernelList(String),

    #[error("duplicate terminal id {0}")]
    DuplicateTerminal(TerminalId),

    #[error("terminal {terminal} references unknown stage '{stage}'")]
    UnknownTerminalStage { terminal: TerminalId, stage: String },

    #[error("link references unknown terminal {0}")]
    UnknownLinkTerminal(TerminalId),

    #[error("link {from} -> {to} must run from an output terminal to an input terminal")]
    BadLinkDirection { from: TerminalId, to: TerminalId },

    #[error("bundle member '{0}' is not a declared stage")]
    UnknownBundleMember(String),

    #[error("trigger group '{group}' member '{member}' is not a declared stage")]
    UnknownTriggerMember { group: String, member: String },

    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to parse policy: {0}")]
    ParseJson(#[from] serde_json::Error),
}

/// Errors raised while assembling a runnable graph from a policy.
///
/// Construction is atomic: any of these aborts the build and leaves no
/// partially wired graph behind.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("failed to create kernel '{kernel}' for stage '{stage}': {reason}")]
    KernelInit {
        stage: String,
        kernel: String,
        reason: String,
    },

    #[error("stage '{0}' has inputs but no producer stage")]
    MissingProducer(String),

    #[error("stage '{stage}' has {count} producer stages, exactly one is required")]
    MultipleProducers { stage: String, count: usize },

    #[error("stage links form a cycle involving '{0}'")]
    CycleDetected(String),

    #[error("external {direction} stream on {port} matched no free stage terminal")]
    UnboundPort { port: Port, direction: &'static str },

    #[error("no terminal assignment available for stage '{stage}' {direction} terminals")]
    PortsExhausted {
        stage: String,
        direction: &'static str,
    },
}

/// Failure of one stage transform for one frame. Never fatal to the graph.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("required input missing on {0}")]
    MissingInput(Port),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("kernel is not ready: {0}")]
    NotReady(String),
}

/// Failure of the per-frame settings computation. Logged, never fatal.
#[derive(Error, Debug)]
#[error("settings preparation failed for sequence {sequence} stream {stream_id}: {reason}")]
pub struct TuningError {
    pub sequence: SequenceId,
    pub stream_id: StreamId,
    pub reason: String,
}

/// Errors surfaced by the pipeline facade and the frame processor.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline is not running")]
    NotRunning,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("no graph installed for tuning mode {0:?}")]
    UnknownMode(crate::core::context::TuningMode),

    #[error("task carries no input buffers")]
    EmptyTask,

    #[error("retained raw frame for sequence {0} is no longer available")]
    RawUnavailable(SequenceId),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type StageResult<T> = Result<T, StageError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Crate-level error for callers that do not want layer granularity.
#[derive(Error, Debug)]
pub enum CamGraphError {
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

pub type CamGraphResult<T> = Result<T, CamGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::MultipleProducers {
            stage: "post".to_string(),
            count: 2,
        };
        assert!(err.to_string().contains("post"));
        assert!(err.to_string().contains("2"));
    }

    #[test]
    fn test_error_conversion_chain() {
        fn fails() -> ConfigResult<()> {
            Err(PolicyError::NoStages)?
        }
        let err: CamGraphError = fails().unwrap_err().into();
        assert!(matches!(err, CamGraphError::Config(_)));
    }

    #[test]
    fn test_unbound_port_mentions_direction() {
        let err = ConfigError::UnboundPort {
            port: crate::core::types::Port::Second,
            direction: "output",
        };
        assert!(err.to_string().contains("output"));
        assert!(err.to_string().contains("port1"));
    }
}
