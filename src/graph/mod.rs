//! Declarative policies, terminal resolution, and graph construction.

pub mod builder;
pub mod policy;
pub mod terminal;

pub use builder::GraphBuilder;
pub use policy::{
    BundleMember, BundlePolicy, GraphPolicy, LinkSpec, StagePolicy, TerminalSpec, TriggerPolicy,
};
pub use terminal::{Direction, TerminalId};
