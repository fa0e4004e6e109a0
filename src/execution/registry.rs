//! Tracking of in-flight tasks and their completion.
//!
//! A task is one frame's submission: its input buffers, its requested output
//! buffers, and flags. The registry counts returned output buffers against
//! the number requested and destroys the task when they are equal. Returned
//! buffers are matched by identity at their port, never by sequence alone,
//! because a stopped queue can return buffers out of order during drain.

use crate::core::buffer::{FrameBuffer, PortBufferMap};
use crate::core::types::{Port, SequenceId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One frame submission.
#[derive(Debug, Clone)]
pub struct TaskData {
    /// Input buffers, one per bound input port, all present.
    pub inputs: PortBufferMap,
    /// Requested outputs. `None` slots were not requested for this frame.
    pub outputs: PortBufferMap,
    pub sequence: SequenceId,
    /// Fake tasks warm internal state; their completions are tracked but the
    /// per-buffer results are never delivered to observers.
    pub fake: bool,
    /// Set when the enhanced branch was bypassed for this frame.
    pub bypass_enhanced: bool,
}

impl TaskData {
    pub fn new(inputs: PortBufferMap, outputs: PortBufferMap, sequence: SequenceId) -> Self {
        Self {
            inputs,
            outputs,
            sequence,
            fake: false,
            bypass_enhanced: false,
        }
    }

    /// Number of output buffers actually requested.
    pub fn expected_outputs(&self) -> usize {
        self.outputs.values().flatten().count()
    }
}

struct TaskInfo {
    data: TaskData,
    expected: usize,
    returned: usize,
}

/// Outcome of reporting one returned buffer.
pub struct ReturnOutcome {
    /// The task the buffer belonged to, for observer delivery decisions.
    pub fake: bool,
    /// Present when this return completed the task.
    pub completed: Option<TaskData>,
}

/// Registry of in-flight tasks, keyed by sequence plus buffer identity.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskInfo>>,
    idle: Condvar,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A task with no requested outputs completes
    /// immediately and is returned to the caller for delivery; it is never
    /// stored.
    pub fn add_task(&self, data: TaskData) -> Option<TaskData> {
        let expected = data.expected_outputs();
        if expected == 0 {
            return Some(data);
        }
        self.tasks.lock().push(TaskInfo {
            data,
            expected,
            returned: 0,
        });
        None
    }

    /// Report a buffer coming back from an output-edge stage.
    ///
    /// Matches the oldest task whose output slot at `port` holds a buffer
    /// with the same identity. Returns `None` when nothing matched, which the
    /// caller logs and otherwise ignores.
    pub fn on_buffer_returned(&self, port: Port, buffer: &Arc<FrameBuffer>) -> Option<ReturnOutcome> {
        let mut tasks = self.tasks.lock();
        let index = tasks.iter().position(|task| {
            task.data
                .outputs
                .get(&port)
                .and_then(|slot| slot.as_ref())
                .map_or(false, |b| b.id() == buffer.id())
                && task.returned < task.expected
        })?;

        tasks[index].returned += 1;
        let fake = tasks[index].data.fake;
        let completed = if tasks[index].returned >= tasks[index].expected {
            let info = tasks.remove(index);
            if tasks.is_empty() {
                self.idle.notify_all();
            }
            Some(info.data)
        } else {
            None
        };
        Some(ReturnOutcome { fake, completed })
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn contains_sequence(&self, sequence: SequenceId) -> bool {
        self.tasks.lock().iter().any(|t| t.data.sequence == sequence)
    }

    /// Block until no tasks are in flight. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.idle.wait_for(&mut tasks, remaining).timed_out() && !tasks.is_empty() {
                return false;
            }
        }
        true
    }

    /// Drop all tasks, returning their data. Used when a stopping pipeline
    /// abandons its in-flight frames.
    pub fn clear(&self) -> Vec<TaskData> {
        let mut tasks = self.tasks.lock();
        let drained = tasks.drain(..).map(|t| t.data).collect();
        self.idle.notify_all();
        drained
    }
}
