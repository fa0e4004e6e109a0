//! Stage kernel traits and the built-in passthrough kernel.

use crate::core::buffer::PortBufferMap;
use crate::core::error::{ConfigError, StageResult};

/// One processing step inside a stage.
///
/// Kernels transform a set of input buffers into a set of output buffers.
/// They see only `PortBufferMap`s: routing, sequencing, and synchronization
/// are the stage queue's business, not the kernel's.
pub trait StageKernel: Send {
    /// Kernel name, for logs and factory dispatch.
    fn name(&self) -> &str;

    /// Process one frame. Absent slots (`None`) must be left untouched.
    ///
    /// An error here degrades the frame to a passthrough copy; it never
    /// stops the pipeline.
    fn transform(&mut self, inputs: &PortBufferMap, outputs: &PortBufferMap) -> StageResult<()>;

    /// Discard internal state between sessions.
    fn reset(&mut self) {}
}

/// Creates kernels by name when the graph is built from a policy.
pub trait KernelFactory: Send + Sync {
    /// Build the kernel chain for one stage.
    ///
    /// `kernels` is the ordered kernel name list from the stage policy.
    /// Failing here aborts graph construction.
    fn create(&self, stage: &str, kernels: &[String]) -> Result<Box<dyn StageKernel>, ConfigError>;
}

/// Copies each input verbatim to every requested output.
///
/// Used as the degraded-mode fallback and as the default kernel for stages
/// that only exist to route or fan out buffers.
#[derive(Debug, Default)]
pub struct PassthroughKernel {
    name: String,
}

impl PassthroughKernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl StageKernel for PassthroughKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&mut self, inputs: &PortBufferMap, outputs: &PortBufferMap) -> StageResult<()> {
        let source = inputs
            .values()
            .flatten()
            .next()
            .ok_or(crate::core::error::StageError::MissingInput(
                crate::core::types::Port::Main,
            ))?;

        for slot in outputs.values().flatten() {
            slot.fill_from(source);
        }
        Ok(())
    }
}

/// Factory that answers every request with a [`PassthroughKernel`].
#[derive(Debug, Default)]
pub struct PassthroughFactory;

impl KernelFactory for PassthroughFactory {
    fn create(&self, stage: &str, _kernels: &[String]) -> Result<Box<dyn StageKernel>, ConfigError> {
        Ok(Box::new(PassthroughKernel::new(stage)))
    }
}
