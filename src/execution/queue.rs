//! Per-stage producer/consumer buffer queue and worker loop.
//!
//! Every stage owns one [`StageQueue`]: per-port input and output FIFOs, a
//! kernel chain, and (unless a trigger group claims the stage) a dedicated
//! worker thread. A frame is processed once every input port and every output
//! port has a queued entry; `None` output entries keep the FIFOs paired with
//! their inputs and select the fast path or scratch substitution.
//!
//! Buffer ownership is a closed loop: a consumer's input pool is seeded into
//! its producer's output FIFOs at build time, and every consumed input is
//! recycled back to the producer after processing. Input-edge buffers are
//! externally owned and never recycled here.

use crate::core::buffer::{has_valid_buffers, FrameBuffer, PortBufferMap};
use crate::core::context::SessionContext;
use crate::core::stage::StageKernel;
use crate::core::types::{NotifyOrder, Port, SequenceId, StreamConfig, StreamId, StreamKind};
use crate::graph::policy::StagePolicy;
use crate::sync::barrier::{BundleBarrier, WaitOutcome};
use crate::sync::scheduler::SchedulerNode;
use indexmap::IndexMap;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Receiver of output-edge frames and per-frame statistics.
///
/// Implemented by the pipeline graph; stage queues hold it weakly so the
/// graph can own its stages without a reference cycle.
pub trait FrameSink: Send + Sync {
    fn on_frame_done(&self, stage: &str, port: Port, buffer: &Arc<FrameBuffer>);
    fn on_stats_done(&self, stage: &str, sequence: SequenceId);
}

struct QueueState {
    input_queue: IndexMap<Port, VecDeque<Arc<FrameBuffer>>>,
    output_queue: IndexMap<Port, VecDeque<Option<Arc<FrameBuffer>>>>,
    /// One internal buffer per output port, substituted when the caller did
    /// not request that output but the kernel still needs somewhere to write.
    scratch: IndexMap<Port, Arc<FrameBuffer>>,
}

enum Fetched {
    Ready {
        inputs: IndexMap<Port, Arc<FrameBuffer>>,
        outputs: PortBufferMap,
    },
    NotReady,
    Stopped,
}

/// One stage's queues, kernel, and worker.
pub struct StageQueue {
    name: String,
    stream_id: StreamId,
    stream_kind: StreamKind,
    notify_order: NotifyOrder,
    emits_stats: bool,
    input_edge: bool,
    output_edge: bool,
    /// True when a trigger group drives this stage instead of its own thread.
    scheduled: AtomicBool,
    running: AtomicBool,
    kernel: Mutex<Box<dyn StageKernel>>,
    state: Mutex<QueueState>,
    frame_available: Condvar,
    output_available: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    producer: Mutex<Option<Weak<StageQueue>>>,
    consumers: Mutex<Vec<Weak<StageQueue>>>,
    sink: Mutex<Option<Weak<dyn FrameSink>>>,
    barrier: Mutex<Option<Arc<BundleBarrier>>>,
    ctx: Arc<SessionContext>,
}

impl StageQueue {
    pub fn new(
        policy: &StagePolicy,
        kernel: Box<dyn StageKernel>,
        input_edge: bool,
        output_edge: bool,
        ctx: Arc<SessionContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: policy.name.clone(),
            stream_id: policy.stream_id,
            stream_kind: policy.stream_kind,
            notify_order: policy.notify_order,
            emits_stats: policy.emits_stats,
            input_edge,
            output_edge,
            scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            kernel: Mutex::new(kernel),
            state: Mutex::new(QueueState {
                input_queue: IndexMap::new(),
                output_queue: IndexMap::new(),
                scratch: IndexMap::new(),
            }),
            frame_available: Condvar::new(),
            output_available: Condvar::new(),
            worker: Mutex::new(None),
            producer: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            barrier: Mutex::new(None),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn stream_kind(&self) -> StreamKind {
        self.stream_kind
    }

    pub fn is_input_edge(&self) -> bool {
        self.input_edge
    }

    pub fn is_output_edge(&self) -> bool {
        self.output_edge
    }

    /// Declare this stage's port sets and allocate output scratch space.
    /// Must run before `start`.
    pub fn set_frame_info(
        &self,
        inputs: IndexMap<Port, StreamConfig>,
        outputs: IndexMap<Port, StreamConfig>,
    ) {
        let mut state = self.state.lock();
        state.input_queue = inputs.keys().map(|p| (*p, VecDeque::new())).collect();
        state.output_queue = outputs.keys().map(|p| (*p, VecDeque::new())).collect();
        state.scratch = outputs
            .iter()
            .map(|(port, config)| {
                (
                    *port,
                    FrameBuffer::new(*config, crate::core::types::FrameUsage::Opaque),
                )
            })
            .collect();
    }

    pub fn set_producer(&self, producer: &Arc<StageQueue>) {
        *self.producer.lock() = Some(Arc::downgrade(producer));
    }

    pub fn add_consumer(&self, consumer: &Arc<StageQueue>) {
        self.consumers.lock().push(Arc::downgrade(consumer));
    }

    pub fn set_sink(&self, sink: Weak<dyn FrameSink>) {
        *self.sink.lock() = Some(sink);
    }

    pub fn set_barrier(&self, barrier: Arc<BundleBarrier>) {
        *self.barrier.lock() = Some(barrier);
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.store(scheduled, Ordering::Release);
    }

    /// Queue a filled input buffer. Buffers for ports this stage does not
    /// own are ignored, which lets producers fan out blindly.
    pub fn submit_input(&self, port: Port, buffer: Arc<FrameBuffer>) -> bool {
        let mut state = self.state.lock();
        match state.input_queue.get_mut(&port) {
            Some(queue) => {
                queue.push_back(buffer);
                self.frame_available.notify_all();
                true
            }
            None => false,
        }
    }

    /// Queue an output slot. `None` must still be queued so the output FIFO
    /// stays paired one-to-one with the inputs of the same frame.
    pub fn submit_output(&self, port: Port, slot: Option<Arc<FrameBuffer>>) -> bool {
        let mut state = self.state.lock();
        match state.output_queue.get_mut(&port) {
            Some(queue) => {
                queue.push_back(slot);
                self.output_available.notify_all();
                true
            }
            None => false,
        }
    }

    /// Number of queued entries on one input port.
    pub fn pending_inputs(&self, port: Port) -> usize {
        self.state
            .lock()
            .input_queue
            .get(&port)
            .map_or(0, VecDeque::len)
    }

    /// Begin processing. Spawns the worker thread unless a trigger group
    /// drives this stage.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);
        if self.scheduled.load(Ordering::Acquire) {
            return;
        }
        let queue = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("stage-{}", self.name))
            .spawn(move || {
                debug!("stage {} worker started", queue.name);
                while queue.run_iteration(true) {}
                debug!("stage {} worker exited", queue.name);
            });
        match handle {
            Ok(h) => *self.worker.lock() = Some(h),
            Err(e) => error!("stage {}: failed to spawn worker: {}", self.name, e),
        }
    }

    /// Wake the worker out of any wait without joining it. Used to stop all
    /// stages in parallel before joining them one by one.
    pub fn notify_stop(&self) {
        self.running.store(false, Ordering::Release);
        let _state = self.state.lock();
        self.frame_available.notify_all();
        self.output_available.notify_all();
    }

    /// Stop processing, join the worker, drop queued buffers, reset the
    /// kernel.
    pub fn stop(&self) {
        self.notify_stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let mut state = self.state.lock();
        for queue in state.input_queue.values_mut() {
            queue.clear();
        }
        for queue in state.output_queue.values_mut() {
            queue.clear();
        }
        drop(state);
        self.kernel.lock().reset();
    }

    /// One worker iteration. Returns `false` when the stage is stopping.
    pub fn run_iteration(&self, blocking: bool) -> bool {
        match self.fetch_buffers(blocking) {
            Fetched::Stopped => false,
            Fetched::NotReady => true,
            Fetched::Ready { inputs, outputs } => {
                self.process_frame(inputs, outputs);
                true
            }
        }
    }

    fn fetch_buffers(&self, blocking: bool) -> Fetched {
        let mut state = self.state.lock();

        let input_ports: Vec<Port> = state.input_queue.keys().copied().collect();
        for port in &input_ports {
            loop {
                if !self.running.load(Ordering::Acquire) {
                    return Fetched::Stopped;
                }
                let empty = state.input_queue.get(port).map_or(true, VecDeque::is_empty);
                if !empty {
                    break;
                }
                if !blocking {
                    return Fetched::NotReady;
                }
                let result = self.frame_available.wait_for(&mut state, self.ctx.queue_wait);
                if !self.running.load(Ordering::Acquire) {
                    return Fetched::Stopped;
                }
                if result.timed_out()
                    && state.input_queue.get(port).map_or(true, VecDeque::is_empty)
                {
                    debug!("stage {}: input wait on {} timed out", self.name, port);
                    return Fetched::NotReady;
                }
            }
        }

        let output_ports: Vec<Port> = state.output_queue.keys().copied().collect();
        for port in &output_ports {
            loop {
                if !self.running.load(Ordering::Acquire) {
                    return Fetched::Stopped;
                }
                let empty = state.output_queue.get(port).map_or(true, VecDeque::is_empty);
                if !empty {
                    break;
                }
                if !blocking {
                    return Fetched::NotReady;
                }
                let result = self
                    .output_available
                    .wait_for(&mut state, self.ctx.queue_wait);
                if !self.running.load(Ordering::Acquire) {
                    return Fetched::Stopped;
                }
                if result.timed_out()
                    && state
                        .output_queue
                        .get(port)
                        .map_or(true, VecDeque::is_empty)
                {
                    debug!("stage {}: output wait on {} timed out", self.name, port);
                    return Fetched::NotReady;
                }
            }
        }

        let mut inputs = IndexMap::with_capacity(input_ports.len());
        for port in &input_ports {
            let Some(buffer) = state
                .input_queue
                .get_mut(port)
                .and_then(VecDeque::pop_front)
            else {
                return Fetched::NotReady;
            };
            inputs.insert(*port, buffer);
        }
        let mut outputs = PortBufferMap::with_capacity(output_ports.len());
        for port in &output_ports {
            let Some(slot) = state
                .output_queue
                .get_mut(port)
                .and_then(VecDeque::pop_front)
            else {
                return Fetched::NotReady;
            };
            outputs.insert(*port, slot);
        }

        Fetched::Ready { inputs, outputs }
    }

    fn process_frame(&self, inputs: IndexMap<Port, Arc<FrameBuffer>>, mut outputs: PortBufferMap) {
        let sequence = inputs.values().next().map_or(-1, |b| b.sequence());

        // Fast path: no output requested for this frame. Inputs go straight
        // back to the producer; input-edge buffers stay externally owned.
        if !has_valid_buffers(&outputs) {
            debug!("stage {}: skipping sequence {}", self.name, sequence);
            self.recycle_inputs(inputs);
            return;
        }

        let mut scratch_ports: Vec<Port> = Vec::new();
        {
            let state = self.state.lock();
            for (port, slot) in outputs.iter_mut() {
                if slot.is_none() {
                    if let Some(scratch) = state.scratch.get(port) {
                        *slot = Some(Arc::clone(scratch));
                        scratch_ports.push(*port);
                    }
                }
            }
        }

        for buffer in outputs.values().flatten() {
            buffer.set_sequence(sequence);
        }

        let barrier = self.barrier.lock().clone();
        if let Some(barrier) = barrier {
            if barrier.wait(&self.name, sequence) == WaitOutcome::TimedOut {
                warn!(
                    "stage {}: proceeding unsynchronized at sequence {}",
                    self.name, sequence
                );
            }
        }

        let input_map: PortBufferMap = inputs
            .iter()
            .map(|(port, buffer)| (*port, Some(Arc::clone(buffer))))
            .collect();

        if let Err(e) = self.kernel.lock().transform(&input_map, &outputs) {
            warn!(
                "stage {}: kernel failed at sequence {}: {}; passing frame through",
                self.name, sequence, e
            );
            if let Some(source) = inputs.values().next() {
                for buffer in outputs.values().flatten() {
                    buffer.fill_from(source);
                }
            }
        }

        // Scratch slots were never requested; hide them again before notify.
        for port in scratch_ports {
            outputs.insert(port, None);
        }

        match self.notify_order {
            NotifyOrder::FrameFirst => {
                self.notify_frame_done(&outputs);
                self.notify_stats_done(sequence);
            }
            NotifyOrder::StatsFirst => {
                self.notify_stats_done(sequence);
                self.notify_frame_done(&outputs);
            }
        }

        self.recycle_inputs(inputs);
    }

    fn notify_frame_done(&self, outputs: &PortBufferMap) {
        if self.output_edge {
            let sink = self.sink.lock().clone();
            if let Some(sink) = sink.and_then(|weak| weak.upgrade()) {
                for (port, slot) in outputs {
                    if let Some(buffer) = slot {
                        sink.on_frame_done(&self.name, *port, buffer);
                    }
                }
            }
            return;
        }
        let consumers = self.consumers.lock().clone();
        for (port, slot) in outputs {
            let Some(buffer) = slot else { continue };
            for consumer in consumers.iter().filter_map(Weak::upgrade) {
                consumer.submit_input(*port, Arc::clone(buffer));
            }
        }
    }

    fn notify_stats_done(&self, sequence: SequenceId) {
        if !self.emits_stats {
            return;
        }
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink.and_then(|weak| weak.upgrade()) {
            sink.on_stats_done(&self.name, sequence);
        }
    }

    fn recycle_inputs(&self, inputs: IndexMap<Port, Arc<FrameBuffer>>) {
        if self.input_edge {
            return;
        }
        let producer = self.producer.lock().clone();
        if let Some(producer) = producer.and_then(|weak| weak.upgrade()) {
            for (port, buffer) in inputs {
                producer.submit_output(port, Some(buffer));
            }
        }
    }
}

impl SchedulerNode for StageQueue {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn process(&self, _tick: i64) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return true;
        }
        self.run_iteration(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{StageError, StageResult};
    use crate::core::stage::PassthroughKernel;
    use crate::core::types::{FrameUsage, PixelFormat};
    use crate::graph::policy::StagePolicy;

    #[derive(Debug, PartialEq)]
    enum Event {
        Frame(Port, SequenceId),
        Stats(SequenceId),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl FrameSink for RecordingSink {
        fn on_frame_done(&self, _stage: &str, port: Port, buffer: &Arc<FrameBuffer>) {
            self.events.lock().push(Event::Frame(port, buffer.sequence()));
        }
        fn on_stats_done(&self, _stage: &str, sequence: SequenceId) {
            self.events.lock().push(Event::Stats(sequence));
        }
    }

    fn config() -> StreamConfig {
        StreamConfig::new(64, 32, PixelFormat::Nv12)
    }

    fn policy(name: &str, order: NotifyOrder, stats: bool) -> StagePolicy {
        StagePolicy {
            name: name.to_string(),
            kernels: vec!["passthrough".to_string()],
            stream_id: 1,
            stream_kind: StreamKind::Video,
            notify_order: order,
            emits_stats: stats,
        }
    }

    fn solo_stage(order: NotifyOrder, stats: bool) -> (Arc<StageQueue>, Arc<RecordingSink>) {
        let queue = StageQueue::new(
            &policy("solo", order, stats),
            Box::new(PassthroughKernel::new("solo")),
            true,
            true,
            Arc::new(SessionContext::default()),
        );
        queue.set_frame_info(
            [(Port::Main, config())].into_iter().collect(),
            [(Port::Main, config())].into_iter().collect(),
        );
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
        let sink_dyn: Arc<dyn FrameSink> = sink.clone();
        queue.set_sink(Arc::downgrade(&sink_dyn));
        queue.set_scheduled(true);
        queue.start();
        (queue, sink)
    }

    #[test]
    fn test_processes_paired_buffers() {
        let (queue, sink) = solo_stage(NotifyOrder::FrameFirst, false);
        let input = FrameBuffer::with_sequence(config(), FrameUsage::Preview, 11);
        let output = FrameBuffer::new(config(), FrameUsage::Preview);

        queue.submit_input(Port::Main, input);
        queue.submit_output(Port::Main, Some(output.clone()));
        assert!(queue.run_iteration(false));

        assert_eq!(output.sequence(), 11);
        assert_eq!(sink.events.lock().as_slice(), &[Event::Frame(Port::Main, 11)]);
    }

    #[test]
    fn test_null_output_takes_fast_path() {
        let (queue, sink) = solo_stage(NotifyOrder::FrameFirst, true);
        queue.submit_input(
            Port::Main,
            FrameBuffer::with_sequence(config(), FrameUsage::Preview, 5),
        );
        queue.submit_output(Port::Main, None);
        assert!(queue.run_iteration(false));
        // No frame, no stats: the frame was skipped entirely.
        assert!(sink.events.lock().is_empty());
    }

    #[test]
    fn test_not_ready_without_output() {
        let (queue, sink) = solo_stage(NotifyOrder::FrameFirst, false);
        queue.submit_input(
            Port::Main,
            FrameBuffer::with_sequence(config(), FrameUsage::Preview, 5),
        );
        assert!(queue.run_iteration(false));
        assert!(sink.events.lock().is_empty());
        assert_eq!(queue.pending_inputs(Port::Main), 1);
    }

    #[test]
    fn test_stats_first_ordering() {
        let (queue, sink) = solo_stage(NotifyOrder::StatsFirst, true);
        queue.submit_input(
            Port::Main,
            FrameBuffer::with_sequence(config(), FrameUsage::Preview, 8),
        );
        queue.submit_output(Port::Main, Some(FrameBuffer::new(config(), FrameUsage::Preview)));
        queue.run_iteration(false);
        assert_eq!(
            sink.events.lock().as_slice(),
            &[Event::Stats(8), Event::Frame(Port::Main, 8)]
        );
    }

    struct FailingKernel;
    impl StageKernel for FailingKernel {
        fn name(&self) -> &str {
            "failing"
        }
        fn transform(&mut self, _: &PortBufferMap, _: &PortBufferMap) -> StageResult<()> {
            Err(StageError::Transform("synthetic".to_string()))
        }
    }

    #[test]
    fn test_kernel_failure_degrades_to_passthrough() {
        let queue = StageQueue::new(
            &policy("broken", NotifyOrder::FrameFirst, false),
            Box::new(FailingKernel),
            true,
            true,
            Arc::new(SessionContext::default()),
        );
        queue.set_frame_info(
            [(Port::Main, config())].into_iter().collect(),
            [(Port::Main, config())].into_iter().collect(),
        );
        queue.set_scheduled(true);
        queue.start();

        let input = FrameBuffer::with_sequence(config(), FrameUsage::Preview, 3);
        input.with_payload_mut(|d| d[0] = 0x77);
        let output = FrameBuffer::new(config(), FrameUsage::Preview);
        queue.submit_input(Port::Main, input);
        queue.submit_output(Port::Main, Some(output.clone()));
        queue.run_iteration(false);

        assert_eq!(output.sequence(), 3);
        assert_eq!(output.with_payload(|d| d[0]), 0x77);
    }

    #[test]
    fn test_internal_stage_recycles_inputs_to_producer() {
        let ctx = Arc::new(SessionContext::default());
        let front = StageQueue::new(
            &policy("front", NotifyOrder::FrameFirst, false),
            Box::new(PassthroughKernel::new("front")),
            true,
            false,
            Arc::clone(&ctx),
        );
        front.set_frame_info(
            [(Port::Main, config())].into_iter().collect(),
            [(Port::Main, config())].into_iter().collect(),
        );
        let post = StageQueue::new(
            &policy("post", NotifyOrder::FrameFirst, false),
            Box::new(PassthroughKernel::new("post")),
            false,
            true,
            ctx,
        );
        post.set_frame_info(
            [(Port::Main, config())].into_iter().collect(),
            [(Port::Main, config())].into_iter().collect(),
        );
        front.add_consumer(&post);
        post.set_producer(&front);
        front.set_scheduled(true);
        post.set_scheduled(true);
        front.start();
        post.start();

        // Seed front's output FIFO with post's pool buffer, as the builder
        // does for every internal link.
        let pool = FrameBuffer::new(config(), FrameUsage::Opaque);
        front.submit_output(Port::Main, Some(pool));

        front.submit_input(
            Port::Main,
            FrameBuffer::with_sequence(config(), FrameUsage::Preview, 21),
        );
        front.run_iteration(false);
        assert_eq!(post.pending_inputs(Port::Main), 1);

        let user_out = FrameBuffer::new(config(), FrameUsage::Preview);
        post.submit_output(Port::Main, Some(user_out.clone()));
        post.run_iteration(false);

        assert_eq!(user_out.sequence(), 21);
        // Post recycled the pool buffer back into front's output FIFO, so a
        // second frame can run without new allocations.
        front.submit_input(
            Port::Main,
            FrameBuffer::with_sequence(config(), FrameUsage::Preview, 22),
        );
        front.run_iteration(false);
        assert_eq!(post.pending_inputs(Port::Main), 1);
    }
}
