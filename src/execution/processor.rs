//! Session-level frame dispatch across tuning-mode graphs.
//!
//! The [`FrameProcessor`] owns one built [`PipelineGraph`] per tuning mode
//! plus the raw retention arena. It serializes submissions, retains raw
//! inputs for reprocessing, replays retained frames as fake tasks to warm
//! temporal filters ahead of a still capture, and performs the
//! drain-then-swap dance when a frame arrives under a different tuning mode.

use crate::core::buffer::{FrameBuffer, PortBufferMap};
use crate::core::context::{SessionContext, TuningMode};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{FrameUsage, Port, SequenceId};
use crate::execution::pipeline::{GraphObserver, PipelineGraph, SettingsProvider};
use crate::execution::registry::TaskData;
use crate::execution::retention::{RawFrame, RawRetention};
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One frame's submission to the processor.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Raw input buffers by external port, all present.
    pub inputs: RawFrame,
    /// Requested outputs by external port.
    pub outputs: PortBufferMap,
    pub sequence: SequenceId,
    pub mode: TuningMode,
    /// The enhanced branch was bypassed upstream for this frame.
    pub bypass_enhanced: bool,
}

impl FrameRequest {
    pub fn new(inputs: RawFrame, outputs: PortBufferMap, sequence: SequenceId) -> Self {
        Self {
            inputs,
            outputs,
            sequence,
            mode: TuningMode::default(),
            bypass_enhanced: false,
        }
    }

    pub fn with_mode(mut self, mode: TuningMode) -> Self {
        self.mode = mode;
        self
    }

    fn has_still_output(&self) -> bool {
        self.outputs
            .values()
            .flatten()
            .any(|b| b.usage() == FrameUsage::StillCapture)
    }
}

/// Forwards graph events to the session observer and keeps the retention
/// arena's in-flight set in step with task completions.
struct CompletionHook {
    inner: RwLock<Option<Arc<dyn GraphObserver>>>,
    retention: Arc<RawRetention>,
}

impl GraphObserver for CompletionHook {
    fn on_frame_available(&self, port: Port, buffer: &Arc<FrameBuffer>) {
        if let Some(observer) = self.inner.read().clone() {
            observer.on_frame_available(port, buffer);
        }
    }

    fn on_task_complete(&self, task: &TaskData) {
        self.retention.clear_in_flight(task.sequence);
        if let Some(observer) = self.inner.read().clone() {
            observer.on_task_complete(task);
        }
    }

    fn on_stats_ready(&self, sequence: SequenceId) {
        if let Some(observer) = self.inner.read().clone() {
            observer.on_stats_ready(sequence);
        }
    }
}

/// Dispatches frames into the graph of the active tuning mode.
pub struct FrameProcessor {
    ctx: Arc<SessionContext>,
    graphs: IndexMap<TuningMode, PipelineGraph>,
    retention: Arc<RawRetention>,
    hook: Arc<CompletionHook>,
    current_mode: Mutex<TuningMode>,
    /// Serializes submissions against each other and against mode swaps.
    dispatch: Mutex<()>,
    running: AtomicBool,
}

impl FrameProcessor {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let retention = Arc::new(RawRetention::new(ctx.max_raw, ctx.max_in_flight));
        Self {
            ctx,
            graphs: IndexMap::new(),
            retention: Arc::clone(&retention),
            hook: Arc::new(CompletionHook {
                inner: RwLock::new(None),
                retention,
            }),
            current_mode: Mutex::new(TuningMode::default()),
            dispatch: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    /// Install a built graph for one tuning mode. Must happen before start.
    pub fn install_graph(&mut self, mode: TuningMode, graph: PipelineGraph) {
        graph.set_observer(Arc::clone(&self.hook) as Arc<dyn GraphObserver>);
        self.graphs.insert(mode, graph);
    }

    pub fn set_observer(&self, observer: Arc<dyn GraphObserver>) {
        *self.hook.inner.write() = Some(observer);
    }

    pub fn set_settings_provider(&self, provider: Arc<dyn SettingsProvider>) {
        for graph in self.graphs.values() {
            graph.set_settings_provider(Arc::clone(&provider));
        }
    }

    pub fn retention(&self) -> &RawRetention {
        &self.retention
    }

    pub fn current_mode(&self) -> TuningMode {
        *self.current_mode.lock()
    }

    /// Start the graph of the current tuning mode.
    pub fn start(&self) -> PipelineResult<()> {
        let mode = self.current_mode();
        let graph = self
            .graphs
            .get(&mode)
            .ok_or(PipelineError::UnknownMode(mode))?;
        graph.start()?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the active graph and drop every retained raw frame.
    pub fn stop(&self) {
        let _guard = self.dispatch.lock();
        self.running.store(false, Ordering::Release);
        let mode = self.current_mode();
        if let Some(graph) = self.graphs.get(&mode) {
            graph.stop();
        }
        let dropped = self.retention.drain();
        if !dropped.is_empty() {
            debug!("dropped {} retained raw frames on stop", dropped.len());
        }
    }

    /// Submit one frame.
    ///
    /// Retains the raw inputs when raw holding is enabled, swaps graphs if
    /// the tuning mode changed, replays the pre-roll for still captures, and
    /// dispatches the task.
    pub fn submit_frame(&self, request: FrameRequest) -> PipelineResult<()> {
        let _guard = self.dispatch.lock();
        if !self.running.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }
        if request.inputs.is_empty() {
            return Err(PipelineError::EmptyTask);
        }

        if self.ctx.hold_raw {
            // Eviction picks the oldest frame not in flight; its buffers go
            // back to the capture side when the last Arc drops.
            self.retention
                .insert(request.sequence, request.inputs.clone());
        }

        {
            let mut mode = self.current_mode.lock();
            if *mode != request.mode {
                self.swap_graphs(*mode, request.mode)?;
                *mode = request.mode;
            }
        }

        let graph = self
            .graphs
            .get(&request.mode)
            .ok_or(PipelineError::UnknownMode(request.mode))?;

        if self.ctx.hold_raw && self.ctx.preroll_frames > 0 && request.has_still_output() {
            self.submit_preroll(graph, &request)?;
        }

        self.retention.mark_in_flight(request.sequence);

        let inputs: PortBufferMap = request
            .inputs
            .iter()
            .map(|(port, buffer)| (*port, Some(Arc::clone(buffer))))
            .collect();
        let mut task = TaskData::new(inputs, request.outputs.clone(), request.sequence);
        task.bypass_enhanced = request.bypass_enhanced;
        graph.submit(task)
    }

    /// Resubmit a retained raw frame under the current tuning mode.
    ///
    /// Serves still requests that arrive after the live frame was already
    /// consumed by the preview stream. Fails when the frame has aged out of
    /// the retention arena.
    pub fn reprocess_frame(
        &self,
        sequence: SequenceId,
        outputs: PortBufferMap,
    ) -> PipelineResult<()> {
        let _guard = self.dispatch.lock();
        if !self.running.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }
        let raw = self
            .retention
            .fetch(sequence)
            .ok_or(PipelineError::RawUnavailable(sequence))?;
        let mode = self.current_mode();
        let graph = self
            .graphs
            .get(&mode)
            .ok_or(PipelineError::UnknownMode(mode))?;

        info!("reprocessing retained raw frame {}", sequence);
        self.retention.mark_in_flight(sequence);
        let inputs: PortBufferMap = raw
            .iter()
            .map(|(port, buffer)| (*port, Some(Arc::clone(buffer))))
            .collect();
        graph.submit(TaskData::new(inputs, outputs, sequence))
    }

    /// Replay retained raw frames preceding a still capture as fake tasks.
    ///
    /// Fake tasks keep only the still-tagged outputs so temporal filters see
    /// the same frames the capture did; their per-buffer results are never
    /// delivered.
    fn submit_preroll(&self, graph: &PipelineGraph, request: &FrameRequest) -> PipelineResult<()> {
        for offset in (1..=self.ctx.preroll_frames as i64).rev() {
            let sequence = request.sequence - offset;
            if sequence < 0 {
                continue;
            }
            let Some(raw) = self.retention.fetch(sequence) else {
                debug!("pre-roll raw frame {} already evicted", sequence);
                continue;
            };
            info!("pre-rolling retained raw frame {}", sequence);
            self.retention.mark_in_flight(sequence);

            let inputs: PortBufferMap = raw
                .iter()
                .map(|(port, buffer)| (*port, Some(Arc::clone(buffer))))
                .collect();
            let outputs: PortBufferMap = request
                .outputs
                .iter()
                .map(|(port, slot)| {
                    let keep = slot
                        .as_ref()
                        .filter(|b| b.usage() == FrameUsage::StillCapture)
                        .cloned();
                    (*port, keep)
                })
                .collect();
            let mut fake = TaskData::new(inputs, outputs, sequence);
            fake.fake = true;
            fake.bypass_enhanced = request.bypass_enhanced;
            graph.submit(fake)?;
        }
        Ok(())
    }

    /// Drain the old graph, stop it, start the new one. A drain timeout is
    /// logged and the in-flight tasks are abandoned; the swap proceeds.
    fn swap_graphs(&self, old_mode: TuningMode, new_mode: TuningMode) -> PipelineResult<()> {
        info!("tuning mode switch {:?} -> {:?}", old_mode, new_mode);
        if let Some(old) = self.graphs.get(&old_mode) {
            old.pause();
            if !old.wait_idle(self.ctx.drain_timeout) {
                warn!(
                    "drain of {:?} graph timed out with {} tasks in flight",
                    old_mode,
                    old.in_flight()
                );
            }
            old.stop();
        }
        let new = self
            .graphs
            .get(&new_mode)
            .ok_or(PipelineError::UnknownMode(new_mode))?;
        new.start()?;
        Ok(())
    }
}
