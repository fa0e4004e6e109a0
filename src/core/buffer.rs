//! Frame buffers and the port-indexed maps that carry them.

use crate::core::types::{FrameUsage, Port, SequenceId, StreamConfig};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Stable identity of a frame buffer.
///
/// Task completion matches returned buffers by identity, never by value:
/// the same allocation may carry many different frames over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(Uuid);

impl BufferId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One frame's worth of image data plus routing metadata.
///
/// Buffers are shared as `Arc<FrameBuffer>` between the submitting caller,
/// stage queues, and the task registry. The sequence field is atomic because
/// a stage worker stamps it while the registry reads it; the payload sits
/// behind a mutex because two stages never touch the same buffer at once, but
/// the borrow checker cannot see the queue handoff that guarantees it.
#[derive(Debug)]
pub struct FrameBuffer {
    id: BufferId,
    config: StreamConfig,
    usage: FrameUsage,
    sequence: AtomicI64,
    payload: Mutex<Vec<u8>>,
}

impl FrameBuffer {
    /// Allocate a zero-filled buffer sized for `config`.
    pub fn new(config: StreamConfig, usage: FrameUsage) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId::new(),
            config,
            usage,
            sequence: AtomicI64::new(-1),
            payload: Mutex::new(vec![0u8; config.frame_size()]),
        })
    }

    pub fn with_sequence(config: StreamConfig, usage: FrameUsage, sequence: SequenceId) -> Arc<Self> {
        let buf = Self::new(config, usage);
        buf.set_sequence(sequence);
        buf
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn usage(&self) -> FrameUsage {
        self.usage
    }

    pub fn sequence(&self) -> SequenceId {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn set_sequence(&self, sequence: SequenceId) {
        self.sequence.store(sequence, Ordering::Release);
    }

    /// Copy another buffer's payload into this one, clamped to the smaller
    /// of the two allocations, and take over its sequence number.
    pub fn fill_from(&self, other: &FrameBuffer) {
        {
            let src = other.payload.lock();
            let mut dst = self.payload.lock();
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        self.set_sequence(other.sequence());
    }

    /// Run `f` over the raw payload bytes.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.payload.lock())
    }

    /// Run `f` over the raw payload bytes, mutably.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.payload.lock())
    }
}

/// Port-indexed buffer map with explicit absence.
///
/// `None` on an output port means the caller did not request that output for
/// this frame; stages run the fast path or substitute scratch space.
/// IndexMap keeps iteration in insertion order so routing is deterministic.
pub type PortBufferMap = IndexMap<Port, Option<Arc<FrameBuffer>>>;

/// True when at least one slot holds a buffer.
pub fn has_valid_buffers(map: &PortBufferMap) -> bool {
    map.values().any(|slot| slot.is_some())
}

/// Sequence number of the first present buffer, if any.
pub fn primary_sequence(map: &PortBufferMap) -> Option<SequenceId> {
    map.values()
        .flatten()
        .next()
        .map(|buffer| buffer.sequence())
}
