//! The runnable pipeline graph.
//!
//! [`PipelineGraph`] is the facade over one built graph: it accepts tasks,
//! routes their buffers through the external port mappings, tracks them in
//! the task registry, runs the per-sequence settings preparation, and
//! delivers frames, stats, and completions to the session's observer.
//! Observer callbacks are always invoked outside internal locks.

use crate::core::buffer::FrameBuffer;
use crate::core::context::{BranchPrecedence, SessionContext};
use crate::core::error::{PipelineError, PipelineResult, TuningError};
use crate::core::types::{Port, SequenceId, StreamId, StreamKind};
use crate::execution::queue::{FrameSink, StageQueue};
use crate::execution::registry::{TaskData, TaskRegistry};
use crate::sync::barrier::BundleBarrier;
use crate::sync::scheduler::TriggerScheduler;
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Binding of one external graph port to one stage-local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub stage: String,
    pub graph_port: Port,
    pub stage_port: Port,
}

/// One internal link's recyclable buffer pool, seeded into the producing
/// stage's output FIFO on every start.
#[derive(Debug, Clone)]
pub(crate) struct PoolSeed {
    pub stage: String,
    pub port: Port,
    pub config: crate::core::types::StreamConfig,
}

/// Session-side receiver of pipeline results.
pub trait GraphObserver: Send + Sync {
    /// A requested output buffer is filled and ready at `port`.
    fn on_frame_available(&self, port: Port, buffer: &Arc<FrameBuffer>);

    /// All requested outputs of a task have returned.
    fn on_task_complete(&self, task: &TaskData);

    /// A stats-emitting stage finished its statistics for `sequence`.
    fn on_stats_ready(&self, _sequence: SequenceId) {}
}

/// Computes per-frame hardware settings ahead of processing.
///
/// Must be idempotent per (sequence, stream): the pipeline already skips
/// repeat calls it knows about, but a drained-and-resubmitted frame may ask
/// again with `force` set.
pub trait SettingsProvider: Send + Sync {
    fn prepare(
        &self,
        sequence: SequenceId,
        stream_id: StreamId,
        force: bool,
    ) -> Result<(), TuningError>;
}

pub(crate) struct GraphCore {
    name: String,
    ctx: Arc<SessionContext>,
    stages: IndexMap<String, Arc<StageQueue>>,
    input_maps: Vec<PortMapping>,
    output_maps: Vec<PortMapping>,
    /// Stream-id chain of each output-bound stage, stage first.
    stage_streams: IndexMap<String, Vec<StreamId>>,
    pool_plan: Vec<PoolSeed>,
    barrier: Arc<BundleBarrier>,
    scheduler: Option<TriggerScheduler>,
    registry: TaskRegistry,
    observer: RwLock<Option<Arc<dyn GraphObserver>>>,
    settings: RwLock<Option<Arc<dyn SettingsProvider>>>,
    /// Streams already prepared per sequence, to keep preparation idempotent.
    prepared: Mutex<BTreeMap<SequenceId, HashSet<StreamId>>>,
    running: AtomicBool,
}

impl FrameSink for GraphCore {
    fn on_frame_done(&self, stage: &str, port: Port, buffer: &Arc<FrameBuffer>) {
        let Some(outcome) = self.registry.on_buffer_returned(port, buffer) else {
            warn!(
                "graph {}: stage {} returned unmatched buffer {} on {}",
                self.name,
                stage,
                buffer.id(),
                port
            );
            return;
        };

        // Observer calls happen here, after the registry lock is released.
        let observer = self.observer.read().clone();
        if let Some(observer) = &observer {
            if !outcome.fake {
                observer.on_frame_available(port, buffer);
            }
            if let Some(task) = &outcome.completed {
                debug!("graph {}: task {} complete", self.name, task.sequence);
                self.forget_prepared(task.sequence);
                observer.on_task_complete(task);
            }
        } else if let Some(task) = &outcome.completed {
            self.forget_prepared(task.sequence);
        }
    }

    fn on_stats_done(&self, _stage: &str, sequence: SequenceId) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_stats_ready(sequence);
        }
    }
}

impl GraphCore {
    fn forget_prepared(&self, sequence: SequenceId) {
        // Sequences complete monotonically; everything at or below is stale.
        self.prepared.lock().retain(|seq, _| *seq > sequence);
    }

    /// True when `stage`'s branch is the inactive side of a shared output
    /// port for this task.
    fn branch_inactive(&self, stage: &str, task: &TaskData, port: Port) -> bool {
        let shared = self
            .output_maps
            .iter()
            .filter(|m| m.graph_port == port)
            .count()
            > 1;
        if !shared {
            return false;
        }

        let still_tagged = task
            .outputs
            .get(&port)
            .and_then(|slot| slot.as_ref())
            .map_or(false, |b| {
                b.usage() == crate::core::types::FrameUsage::StillCapture
            });
        let still_active = match self.ctx.branch_precedence {
            BranchPrecedence::TagAndRun => still_tagged && !task.bypass_enhanced,
            BranchPrecedence::TagOnly => still_tagged,
        };
        let stage_is_still = self
            .stages
            .get(stage)
            .map_or(false, |s| s.stream_kind() == StreamKind::Still);
        stage_is_still != still_active
    }

    /// Run settings preparation for every stream the task's active outputs
    /// reach, once per (sequence, stream). Failures are logged, never fatal.
    fn prepare_settings(&self, task: &TaskData, sequence: SequenceId, force: bool) {
        let provider = self.settings.read().clone();
        let Some(provider) = provider else { return };

        let mut streams: Vec<StreamId> = Vec::new();
        for (port, slot) in &task.outputs {
            if slot.is_none() {
                continue;
            }
            for mapping in self.output_maps.iter().filter(|m| m.graph_port == *port) {
                if self.branch_inactive(&mapping.stage, task, *port) {
                    continue;
                }
                if let Some(chain) = self.stage_streams.get(&mapping.stage) {
                    for id in chain {
                        if !streams.contains(id) {
                            streams.push(*id);
                        }
                    }
                }
            }
        }

        for stream_id in streams {
            let already = !force
                && self
                    .prepared
                    .lock()
                    .get(&sequence)
                    .map_or(false, |set| set.contains(&stream_id));
            if already {
                continue;
            }
            if let Err(e) = provider.prepare(sequence, stream_id, force) {
                warn!("graph {}: {}", self.name, e);
                continue;
            }
            self.prepared
                .lock()
                .entry(sequence)
                .or_default()
                .insert(stream_id);
        }
    }

    /// Route one task's buffers into the bound stage queues.
    ///
    /// Inputs fan out to every mapping of their port. Each output mapping
    /// receives the caller's buffer, or `None` when the caller skipped the
    /// output or the mapping sits on the inactive side of a branch fork.
    fn queue_buffers(&self, task: &TaskData) {
        for (port, slot) in &task.inputs {
            let Some(buffer) = slot else { continue };
            for mapping in self.input_maps.iter().filter(|m| m.graph_port == *port) {
                if let Some(stage) = self.stages.get(&mapping.stage) {
                    stage.submit_input(mapping.stage_port, Arc::clone(buffer));
                }
            }
        }
        for (port, slot) in &task.outputs {
            for mapping in self.output_maps.iter().filter(|m| m.graph_port == *port) {
                let Some(stage) = self.stages.get(&mapping.stage) else {
                    continue;
                };
                let value = match slot {
                    Some(buffer) if !self.branch_inactive(&mapping.stage, task, *port) => {
                        Some(Arc::clone(buffer))
                    }
                    _ => None,
                };
                stage.submit_output(mapping.stage_port, value);
            }
        }
    }
}

/// A built processing graph, ready to start.
pub struct PipelineGraph {
    core: Arc<GraphCore>,
}

impl PipelineGraph {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        name: String,
        ctx: Arc<SessionContext>,
        stages: IndexMap<String, Arc<StageQueue>>,
        input_maps: Vec<PortMapping>,
        output_maps: Vec<PortMapping>,
        stage_streams: IndexMap<String, Vec<StreamId>>,
        pool_plan: Vec<PoolSeed>,
        barrier: Arc<BundleBarrier>,
        scheduler: Option<TriggerScheduler>,
    ) -> Self {
        let core = Arc::new(GraphCore {
            name,
            ctx,
            stages,
            input_maps,
            output_maps,
            stage_streams,
            pool_plan,
            barrier,
            scheduler,
            registry: TaskRegistry::new(),
            observer: RwLock::new(None),
            settings: RwLock::new(None),
            prepared: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        });

        let sink: Arc<dyn FrameSink> = Arc::clone(&core) as Arc<dyn FrameSink>;
        for stage in core.stages.values() {
            stage.set_sink(Arc::downgrade(&sink));
        }

        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn set_observer(&self, observer: Arc<dyn GraphObserver>) {
        *self.core.observer.write() = Some(observer);
    }

    pub fn set_settings_provider(&self, provider: Arc<dyn SettingsProvider>) {
        *self.core.settings.write() = Some(provider);
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Start every stage worker and activate bundles.
    pub fn start(&self) -> PipelineResult<()> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        info!("graph {} starting", self.core.name);
        self.core.barrier.set_active(true);
        for seed in &self.core.pool_plan {
            if let Some(stage) = self.core.stages.get(&seed.stage) {
                for _ in 0..self.core.ctx.max_in_flight {
                    stage.submit_output(
                        seed.port,
                        Some(FrameBuffer::new(
                            seed.config,
                            crate::core::types::FrameUsage::Opaque,
                        )),
                    );
                }
            }
        }
        for stage in self.core.stages.values() {
            stage.start();
        }
        self.core.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop all stages, abandon in-flight tasks, shut the scheduler down.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("graph {} stopping", self.core.name);
        self.core.running.store(false, Ordering::Release);
        // Deactivate first so no stage sleeps on a half-arrived bundle.
        self.core.barrier.set_active(false);
        for stage in self.core.stages.values() {
            stage.notify_stop();
        }
        for stage in self.core.stages.values() {
            stage.stop();
        }
        // The scheduler stays alive so a stopped graph can restart; its
        // ticks are no-ops against stopped stages. Dropping the graph shuts
        // it down for good.
        let abandoned = self.core.registry.clear();
        if !abandoned.is_empty() {
            warn!(
                "graph {}: abandoned {} in-flight tasks",
                self.core.name,
                abandoned.len()
            );
        }
        self.core.prepared.lock().clear();
    }

    /// Suspend bundle synchronization, e.g. while draining for a swap.
    pub fn pause(&self) {
        self.core.barrier.set_active(false);
    }

    pub fn resume(&self) {
        self.core.barrier.set_active(true);
    }

    /// Submit one task for processing.
    ///
    /// A task with no requested outputs completes immediately. Otherwise its
    /// buffers are routed into the stage queues, settings are prepared for
    /// every stream the task touches, and the scheduler (when present) gets
    /// one trigger.
    pub fn submit(&self, task: TaskData) -> PipelineResult<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        if !crate::core::buffer::has_valid_buffers(&task.inputs) {
            return Err(PipelineError::EmptyTask);
        }

        let sequence = task.sequence;
        self.core.prepare_settings(&task, sequence, false);

        if let Some(done) = self.core.registry.add_task(task.clone()) {
            debug!(
                "graph {}: task {} has no outputs, completing immediately",
                self.core.name, sequence
            );
            self.core.forget_prepared(sequence);
            let observer = self.core.observer.read().clone();
            if let Some(observer) = observer {
                observer.on_task_complete(&done);
            }
            return Ok(());
        }

        self.core.queue_buffers(&task);

        // Look ahead one frame so the next sequence's settings are ready
        // before its buffers arrive.
        if self.core.ctx.prepare_next_sequence {
            self.core.prepare_settings(&task, sequence + 1, false);
        }

        if let Some(scheduler) = &self.core.scheduler {
            scheduler.trigger("", sequence);
        }
        Ok(())
    }

    /// Fire an external trigger source by name.
    pub fn trigger(&self, source: &str, tick: i64) {
        if let Some(scheduler) = &self.core.scheduler {
            scheduler.trigger(source, tick);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.core.registry.in_flight()
    }

    /// Block until every in-flight task completed. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.core.registry.wait_idle(timeout)
    }

    pub fn input_mappings(&self) -> &[PortMapping] {
        &self.core.input_maps
    }

    pub fn output_mappings(&self) -> &[PortMapping] {
        &self.core.output_maps
    }

    pub fn stream_chain(&self, stage: &str) -> Option<&Vec<StreamId>> {
        self.core.stage_streams.get(stage)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.core.stages.keys().cloned().collect()
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.stop();
        if let Some(scheduler) = &self.core.scheduler {
            scheduler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::PortBufferMap;
    use crate::core::context::SessionContext;
    use crate::core::stage::PassthroughFactory;
    use crate::core::types::{FrameUsage, NotifyOrder, PixelFormat, StreamConfig};
    use crate::graph::builder::GraphBuilder;
    use crate::graph::policy::tests::linear_policy;
    use crate::graph::policy::{GraphPolicy, LinkSpec, StagePolicy, TerminalSpec};
    use crate::graph::terminal::{Direction, TerminalId};
    use parking_lot::Condvar;

    #[derive(Default)]
    struct EventLog {
        frames: Mutex<Vec<(Port, SequenceId)>>,
        completions: Mutex<Vec<SequenceId>>,
        stats: Mutex<Vec<SequenceId>>,
        cond: Condvar,
        done: Mutex<usize>,
    }

    impl EventLog {
        fn wait_for_completions(&self, count: usize, timeout: Duration) -> bool {
            let mut done = self.done.lock();
            while *done < count {
                if self.cond.wait_for(&mut done, timeout).timed_out() {
                    return *done >= count;
                }
            }
            true
        }
    }

    impl GraphObserver for EventLog {
        fn on_frame_available(&self, port: Port, buffer: &Arc<FrameBuffer>) {
            self.frames.lock().push((port, buffer.sequence()));
        }
        fn on_task_complete(&self, task: &TaskData) {
            self.completions.lock().push(task.sequence);
            let mut done = self.done.lock();
            *done += 1;
            self.cond.notify_all();
        }
        fn on_stats_ready(&self, sequence: SequenceId) {
            self.stats.lock().push(sequence);
        }
    }

    #[derive(Default)]
    struct PrepLog {
        calls: Mutex<Vec<(SequenceId, StreamId, bool)>>,
    }

    impl SettingsProvider for PrepLog {
        fn prepare(
            &self,
            sequence: SequenceId,
            stream_id: StreamId,
            force: bool,
        ) -> Result<(), TuningError> {
            self.calls.lock().push((sequence, stream_id, force));
            Ok(())
        }
    }

    fn raw_buffer(sequence: SequenceId) -> Arc<FrameBuffer> {
        FrameBuffer::with_sequence(
            StreamConfig::new(1920, 1080, PixelFormat::Sgrbg10),
            FrameUsage::Opaque,
            sequence,
        )
    }

    fn yuv_buffer(usage: FrameUsage) -> Arc<FrameBuffer> {
        FrameBuffer::new(StreamConfig::new(1920, 1080, PixelFormat::Nv12), usage)
    }

    fn started_linear() -> (PipelineGraph, Arc<EventLog>, Arc<PrepLog>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let graph = GraphBuilder::build(
            &linear_policy(),
            &PassthroughFactory,
            Arc::new(SessionContext::default()),
        )
        .unwrap();
        let log = Arc::new(EventLog::default());
        let prep = Arc::new(PrepLog::default());
        graph.set_observer(log.clone());
        graph.set_settings_provider(prep.clone());
        graph.start().unwrap();
        (graph, log, prep)
    }

    #[test]
    fn test_single_frame_flows_end_to_end() {
        let (graph, log, prep) = started_linear();
        let out = yuv_buffer(FrameUsage::Preview);
        let task = TaskData::new(
            [(Port::Main, Some(raw_buffer(10)))].into_iter().collect(),
            [(Port::Main, Some(out.clone()))].into_iter().collect(),
            10,
        );
        graph.submit(task).unwrap();

        assert!(log.wait_for_completions(1, Duration::from_secs(5)));
        assert_eq!(out.sequence(), 10);
        assert_eq!(log.frames.lock().as_slice(), &[(Port::Main, 10)]);
        assert_eq!(log.completions.lock().as_slice(), &[10]);
        // front emits stats in the linear policy.
        assert_eq!(log.stats.lock().as_slice(), &[10]);
        assert_eq!(graph.in_flight(), 0);
        // Settings were prepared for the whole stream chain, once each.
        assert_eq!(prep.calls.lock().as_slice(), &[(10, 2, false), (10, 1, false)]);
        graph.stop();
    }

    #[test]
    fn test_zero_output_task_completes_immediately() {
        let (graph, log, _prep) = started_linear();
        let task = TaskData::new(
            [(Port::Main, Some(raw_buffer(3)))].into_iter().collect(),
            [(Port::Main, None)].into_iter().collect(),
            3,
        );
        graph.submit(task).unwrap();
        assert!(log.wait_for_completions(1, Duration::from_secs(1)));
        assert!(log.frames.lock().is_empty());
        graph.stop();
    }

    #[test]
    fn test_submit_requires_running_graph() {
        let graph = GraphBuilder::build(
            &linear_policy(),
            &PassthroughFactory,
            Arc::new(SessionContext::default()),
        )
        .unwrap();
        let task = TaskData::new(
            [(Port::Main, Some(raw_buffer(1)))].into_iter().collect(),
            PortBufferMap::new(),
            1,
        );
        assert!(matches!(
            graph.submit(task),
            Err(PipelineError::NotRunning)
        ));
    }

    #[test]
    fn test_settings_prepared_once_per_sequence() {
        let ctx = Arc::new(SessionContext::default().with_prepare_next_sequence(true));
        let graph = GraphBuilder::build(&linear_policy(), &PassthroughFactory, ctx).unwrap();
        let log = Arc::new(EventLog::default());
        let prep = Arc::new(PrepLog::default());
        graph.set_observer(log.clone());
        graph.set_settings_provider(prep.clone());
        graph.start().unwrap();

        for sequence in [7, 8] {
            let task = TaskData::new(
                [(Port::Main, Some(raw_buffer(sequence)))].into_iter().collect(),
                [(Port::Main, Some(yuv_buffer(FrameUsage::Preview)))]
                    .into_iter()
                    .collect(),
                sequence,
            );
            graph.submit(task).unwrap();
        }
        assert!(log.wait_for_completions(2, Duration::from_secs(5)));
        // Submitting 7 prepares sequences 7 and 8 (look-ahead); submitting 8
        // skips the already-prepared 8 and looks ahead to 9. Two streams per
        // sequence, three sequences, six calls.
        assert_eq!(prep.calls.lock().len(), 6);
        graph.stop();
    }

    /// Policy with a branch fork: front fans out to a video stage and a
    /// still stage, both bound to the same external output port.
    fn forked_policy() -> GraphPolicy {
        let raw = StreamConfig::new(1920, 1080, PixelFormat::Sgrbg10);
        let yuv = StreamConfig::new(1920, 1080, PixelFormat::Nv12);
        let stage = |name: &str, stream_id, kind| StagePolicy {
            name: name.to_string(),
            kernels: vec!["passthrough".to_string()],
            stream_id,
            stream_kind: kind,
            notify_order: NotifyOrder::FrameFirst,
            emits_stats: false,
        };
        GraphPolicy {
            name: "forked".to_string(),
            stages: vec![
                stage("front", 1, StreamKind::Video),
                stage("vid", 2, StreamKind::Video),
                stage("still", 3, StreamKind::Still),
            ],
            terminals: vec![
                TerminalSpec {
                    id: TerminalId(0),
                    stage: "front".to_string(),
                    direction: Direction::Input,
                    config: raw,
                },
                TerminalSpec {
                    id: TerminalId(1),
                    stage: "front".to_string(),
                    direction: Direction::Output,
                    config: yuv,
                },
                TerminalSpec {
                    id: TerminalId(2),
                    stage: "front".to_string(),
                    direction: Direction::Output,
                    config: yuv,
                },
                TerminalSpec {
                    id: TerminalId(3),
                    stage: "vid".to_string(),
                    direction: Direction::Input,
                    config: yuv,
                },
                TerminalSpec {
                    id: TerminalId(4),
                    stage: "vid".to_string(),
                    direction: Direction::Output,
                    config: yuv,
                },
                TerminalSpec {
                    id: TerminalId(5),
                    stage: "still".to_string(),
                    direction: Direction::Input,
                    config: yuv,
                },
                TerminalSpec {
                    id: TerminalId(6),
                    stage: "still".to_string(),
                    direction: Direction::Output,
                    config: yuv,
                },
            ],
            links: vec![
                LinkSpec {
                    from: TerminalId(1),
                    to: TerminalId(3),
                },
                LinkSpec {
                    from: TerminalId(2),
                    to: TerminalId(5),
                },
            ],
            inputs: [(Port::Main, raw)].into_iter().collect(),
            outputs: [(Port::Main, yuv)].into_iter().collect(),
            bundles: vec![],
            trigger_groups: vec![],
        }
    }

    fn submit_forked(bypass_enhanced: bool) -> (Vec<(Port, SequenceId)>, SequenceId) {
        let graph = GraphBuilder::build(
            &forked_policy(),
            &PassthroughFactory,
            Arc::new(SessionContext::default()),
        )
        .unwrap();
        assert_eq!(graph.output_mappings().len(), 2);

        let log = Arc::new(EventLog::default());
        graph.set_observer(log.clone());
        graph.start().unwrap();

        let out = yuv_buffer(FrameUsage::StillCapture);
        let mut task = TaskData::new(
            [(Port::Main, Some(raw_buffer(20)))].into_iter().collect(),
            [(Port::Main, Some(out))].into_iter().collect(),
            20,
        );
        task.bypass_enhanced = bypass_enhanced;
        graph.submit(task).unwrap();

        assert!(log.wait_for_completions(1, Duration::from_secs(5)));
        graph.stop();
        let frames = log.frames.lock().clone();
        (frames, 20)
    }

    #[test]
    fn test_fork_still_branch_wins_for_tagged_task() {
        // Still tag, enhanced branch ran: exactly one delivery, from the
        // still branch; the video branch saw a null output.
        let (frames, seq) = submit_forked(false);
        assert_eq!(frames, vec![(Port::Main, seq)]);
    }

    #[test]
    fn test_fork_bypassed_enhanced_falls_back_to_baseline() {
        // Still tag but the enhanced branch was bypassed: the baseline
        // branch delivers instead, still exactly once.
        let (frames, seq) = submit_forked(true);
        assert_eq!(frames, vec![(Port::Main, seq)]);
    }
}
