//! Session-wide tunables shared by every component of one camera session.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tie-break rule for a shared external output port when the two selection
/// signals disagree.
///
/// The still branch of a forked pipeline is selected when the task carries a
/// still-capture tagged output and, depending on precedence, when the
/// enhanced branch actually ran for this frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPrecedence {
    /// Still branch is active only when the output is still-tagged AND the
    /// enhanced branch ran. A bypassed enhanced branch falls back to the
    /// baseline branch even for still-tagged tasks.
    #[default]
    TagAndRun,
    /// The still-capture tag alone selects the still branch.
    TagOnly,
}

/// Tuning mode of a processing graph. Switching modes at runtime triggers a
/// drain-then-swap reconfiguration in the frame processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    #[default]
    Normal,
    Hdr,
    UltraLowLight,
}

/// Immutable per-session knobs, shared as `Arc<SessionContext>`.
///
/// Built once before graph construction with the `with_*` builders; nothing
/// here changes while the session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Session identifier, only used in logs.
    pub session_id: u32,
    /// Slowest frame rate the session may run at. Scales wait budgets so a
    /// long-exposure session does not trip spurious timeouts.
    pub min_fps: u32,
    /// Budget for one blocking buffer wait inside a stage queue.
    pub queue_wait: Duration,
    /// Budget for draining in-flight tasks before a graph swap.
    pub drain_timeout: Duration,
    /// Base budget for one bundle barrier rendezvous at 30 fps.
    pub barrier_wait_base: Duration,
    /// Retention arena capacity.
    pub max_raw: usize,
    /// Upper bound on concurrently in-flight sequences.
    pub max_in_flight: usize,
    /// Whether input raw frames are retained for later reprocessing.
    pub hold_raw: bool,
    /// Extra retained frames replayed as fake tasks ahead of a still capture,
    /// to warm temporal filters. Zero disables the pre-roll.
    pub preroll_frames: usize,
    /// Shared-output-port tie-break rule.
    pub branch_precedence: BranchPrecedence,
    /// Prepare settings for sequence N+1 while submitting sequence N.
    pub prepare_next_sequence: bool,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            session_id: 0,
            min_fps: 10,
            queue_wait: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            barrier_wait_base: Duration::from_millis(400),
            max_raw: 10,
            max_in_flight: 4,
            hold_raw: false,
            preroll_frames: 0,
            branch_precedence: BranchPrecedence::default(),
            prepare_next_sequence: false,
        }
    }
}

impl SessionContext {
    pub fn new(session_id: u32) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub fn with_min_fps(mut self, fps: u32) -> Self {
        self.min_fps = fps.max(1);
        self
    }

    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, max_raw: usize, max_in_flight: usize) -> Self {
        self.max_raw = max_raw;
        self.max_in_flight = max_in_flight;
        self.hold_raw = true;
        self
    }

    pub fn with_preroll_frames(mut self, frames: usize) -> Self {
        self.preroll_frames = frames;
        self
    }

    pub fn with_branch_precedence(mut self, precedence: BranchPrecedence) -> Self {
        self.branch_precedence = precedence;
        self
    }

    pub fn with_prepare_next_sequence(mut self, enabled: bool) -> Self {
        self.prepare_next_sequence = enabled;
        self
    }

    /// Barrier rendezvous budget, scaled down from 30 fps to the session's
    /// slowest frame rate, never below the base budget.
    pub fn barrier_wait(&self) -> Duration {
        let scale = (30.0 / self.min_fps as f64).max(1.0);
        self.barrier_wait_base.mul_f64(scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_wait_scales_with_slow_fps() {
        let ctx = SessionContext::new(0).with_min_fps(10);
        assert_eq!(ctx.barrier_wait(), Duration::from_millis(1200));
    }

    #[test]
    fn test_barrier_wait_never_below_base() {
        let ctx = SessionContext::new(0).with_min_fps(60);
        assert_eq!(ctx.barrier_wait(), Duration::from_millis(400));
    }

    #[test]
    fn test_retention_builder_enables_hold() {
        let ctx = SessionContext::new(1).with_retention(8, 2);
        assert!(ctx.hold_raw);
        assert_eq!(ctx.max_raw, 8);
        assert_eq!(ctx.max_in_flight, 2);
    }
}
