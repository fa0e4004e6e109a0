//! Retention arena for raw capture frames.
//!
//! When raw holding is enabled, every submitted raw frame is parked here
//! after capture so a later still request can reprocess it. Capacity is
//! bounded: once the arena holds more than `max_raw - max_in_flight` frames,
//! the oldest frame not currently in flight is evicted and its buffers are
//! handed back to the caller for recycling.

use crate::core::buffer::FrameBuffer;
use crate::core::types::{Port, SequenceId};
use indexmap::IndexMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Raw buffers of one retained frame, by input port.
pub type RawFrame = IndexMap<Port, Arc<FrameBuffer>>;

struct RetentionState {
    held: IndexMap<SequenceId, RawFrame>,
    in_flight: HashSet<SequenceId>,
}

/// Bounded arena of retained raw frames.
pub struct RawRetention {
    max_raw: usize,
    max_in_flight: usize,
    state: Mutex<RetentionState>,
}

impl RawRetention {
    pub fn new(max_raw: usize, max_in_flight: usize) -> Self {
        Self {
            max_raw,
            max_in_flight,
            state: Mutex::new(RetentionState {
                held: IndexMap::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Retain one frame. Returns the evicted frame, if capacity forced one
    /// out; the caller owns recycling its buffers.
    pub fn insert(&self, sequence: SequenceId, frame: RawFrame) -> Option<(SequenceId, RawFrame)> {
        let mut state = self.state.lock();
        state.held.insert(sequence, frame);

        let budget = self.max_raw.saturating_sub(self.max_in_flight).max(1);
        if state.held.len() <= budget {
            return None;
        }

        // Oldest first, but never evict a frame still being processed.
        let victim = state
            .held
            .keys()
            .copied()
            .find(|seq| !state.in_flight.contains(seq));
        match victim {
            Some(seq) => {
                debug!("evicting retained raw frame {}", seq);
                state.held.shift_remove(&seq).map(|frame| (seq, frame))
            }
            None => {
                warn!("retention arena over budget but every frame is in flight");
                None
            }
        }
    }

    /// Look up a retained frame without removing it. Used by reprocessing and
    /// the still pre-roll.
    pub fn fetch(&self, sequence: SequenceId) -> Option<RawFrame> {
        self.state.lock().held.get(&sequence).cloned()
    }

    pub fn holds(&self, sequence: SequenceId) -> bool {
        self.state.lock().held.contains_key(&sequence)
    }

    /// Shield a sequence from eviction while it is being processed.
    pub fn mark_in_flight(&self, sequence: SequenceId) {
        self.state.lock().in_flight.insert(sequence);
    }

    pub fn clear_in_flight(&self, sequence: SequenceId) {
        self.state.lock().in_flight.remove(&sequence);
    }

    pub fn len(&self) -> usize {
        self.state.lock().held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().held.is_empty()
    }

    /// Drop everything. Returns all held frames for recycling.
    pub fn drain(&self) -> Vec<(SequenceId, RawFrame)> {
        let mut state = self.state.lock();
        state.in_flight.clear();
        state.held.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FrameUsage, PixelFormat, StreamConfig};

    fn frame(sequence: SequenceId) -> RawFrame {
        [(
            Port::Main,
            FrameBuffer::with_sequence(
                StreamConfig::new(16, 16, PixelFormat::Sgrbg10),
                FrameUsage::Opaque,
                sequence,
            ),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_holds_up_to_budget() {
        // max_raw 6, max_in_flight 2: budget is 4 retained frames.
        let arena = RawRetention::new(6, 2);
        for seq in 0..4 {
            assert!(arena.insert(seq, frame(seq)).is_none());
        }
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn test_evicts_oldest_beyond_budget() {
        let arena = RawRetention::new(6, 2);
        for seq in 0..5 {
            let evicted = arena.insert(seq, frame(seq));
            if seq < 4 {
                assert!(evicted.is_none());
            } else {
                assert_eq!(evicted.unwrap().0, 0);
            }
        }
        assert!(!arena.holds(0));
        assert!(arena.holds(1));
    }

    #[test]
    fn test_in_flight_frames_survive_eviction() {
        let arena = RawRetention::new(6, 2);
        for seq in 0..4 {
            arena.insert(seq, frame(seq));
        }
        arena.mark_in_flight(0);
        let (evicted, _) = arena.insert(4, frame(4)).unwrap();
        // Sequence 0 is shielded; the next oldest goes instead.
        assert_eq!(evicted, 1);
        assert!(arena.holds(0));

        arena.clear_in_flight(0);
        let (evicted, _) = arena.insert(5, frame(5)).unwrap();
        assert_eq!(evicted, 0);
    }

    #[test]
    fn test_fetch_keeps_frame_held() {
        let arena = RawRetention::new(6, 2);
        arena.insert(7, frame(7));
        assert!(arena.fetch(7).is_some());
        assert!(arena.holds(7));
        assert!(arena.fetch(8).is_none());
    }

    #[test]
    fn test_drain_returns_everything() {
        let arena = RawRetention::new(6, 2);
        for seq in 0..3 {
            arena.insert(seq, frame(seq));
        }
        let drained = arena.drain();
        assert_eq!(drained.len(), 3);
        assert!(arena.is_empty());
    }
}
