//! Bounded-skew synchronization between bundled stages.
//!
//! Stages whose hardware shares state (e.g. a pair of pipes feeding one
//! another's temporal reference) must not drift apart by more than a
//! configured number of frames. Each bundle tracks a per-member run count and
//! permitted lead depth; a member that would exceed its lead blocks until
//! every member of the bundle has arrived, then the whole bundle is released
//! at once.

use crate::core::types::SequenceId;
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one barrier arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The member is within its permitted lead, no blocking happened.
    Proceed,
    /// The member blocked and the full rendezvous completed.
    Synchronized,
    /// The member blocked and gave up after the wait budget expired.
    /// The frame proceeds anyway; skew is a quality problem, not a fault.
    TimedOut,
    /// The barrier is inactive, the stage is unbundled, or the sequence
    /// precedes the bundle's start sequence.
    Inactive,
}

struct MemberState {
    depth: u32,
    run_count: u64,
}

struct BundleInner {
    members: Vec<(String, MemberState)>,
    max_depth: u32,
    waiting: usize,
    /// Bumped on every release so sleepers can tell a real release from a
    /// spurious wakeup.
    generation: u64,
}

struct BundleState {
    inner: Mutex<BundleInner>,
    cond: Condvar,
    start_sequence: SequenceId,
}

/// Barrier over all bundles of one graph.
pub struct BundleBarrier {
    bundles: Mutex<Vec<Arc<BundleState>>>,
    active: AtomicBool,
    wait_budget: Duration,
}

impl BundleBarrier {
    pub fn new(wait_budget: Duration) -> Self {
        Self {
            bundles: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            wait_budget,
        }
    }

    /// Register a bundle. `members` pairs stage names with their permitted
    /// lead depth; the bundle's max depth is the largest member depth.
    pub fn add_bundle(&self, members: &[(String, u32)], start_sequence: SequenceId) {
        let max_depth = members.iter().map(|(_, d)| *d).max().unwrap_or(0);
        let bundle = Arc::new(BundleState {
            inner: Mutex::new(BundleInner {
                members: members
                    .iter()
                    .map(|(name, depth)| {
                        (
                            name.clone(),
                            MemberState {
                                depth: *depth,
                                run_count: 0,
                            },
                        )
                    })
                    .collect(),
                max_depth,
                waiting: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
            start_sequence,
        });
        self.bundles.lock().push(bundle);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate or deactivate the barrier.
    ///
    /// Deactivation resets all run counters and releases every sleeper, so a
    /// stopping pipeline never deadlocks on a half-arrived bundle.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        if !active {
            for bundle in self.bundles.lock().iter() {
                let mut inner = bundle.inner.lock();
                for (_, member) in inner.members.iter_mut() {
                    member.run_count = 0;
                }
                inner.waiting = 0;
                inner.generation += 1;
                bundle.cond.notify_all();
            }
        }
    }

    /// Arrive at the barrier for one frame of `stage`.
    pub fn wait(&self, stage: &str, sequence: SequenceId) -> WaitOutcome {
        if !self.is_active() {
            return WaitOutcome::Inactive;
        }

        let bundle = {
            let bundles = self.bundles.lock();
            match bundles
                .iter()
                .find(|b| b.inner.lock().members.iter().any(|(name, _)| name == stage))
            {
                Some(b) => Arc::clone(b),
                None => return WaitOutcome::Inactive,
            }
        };

        if sequence <= bundle.start_sequence {
            return WaitOutcome::Inactive;
        }

        let mut inner = bundle.inner.lock();
        let member_count = inner.members.len();
        let max_depth = inner.max_depth;

        let (run_count, depth) = {
            let Some((_, member)) = inner.members.iter_mut().find(|(name, _)| name == stage) else {
                return WaitOutcome::Inactive;
            };
            member.run_count += 1;
            (member.run_count, member.depth)
        };

        // Within the permitted lead: run free.
        if run_count + depth as u64 <= max_depth as u64 {
            return WaitOutcome::Proceed;
        }

        inner.waiting += 1;
        if inner.waiting >= member_count {
            // Last arrival: release everyone.
            inner.waiting = 0;
            inner.generation += 1;
            bundle.cond.notify_all();
            return WaitOutcome::Synchronized;
        }

        let generation = inner.generation;
        let deadline = Instant::now() + self.wait_budget;
        loop {
            if !self.is_active() {
                return WaitOutcome::Inactive;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                inner.waiting = inner.waiting.saturating_sub(1);
                warn!(
                    "bundle wait timed out for stage {} at sequence {}",
                    stage, sequence
                );
                return WaitOutcome::TimedOut;
            }
            let result = bundle.cond.wait_for(&mut inner, remaining);
            if inner.generation != generation {
                return WaitOutcome::Synchronized;
            }
            if !self.is_active() {
                return WaitOutcome::Inactive;
            }
            if result.timed_out() {
                inner.waiting = inner.waiting.saturating_sub(1);
                warn!(
                    "bundle wait timed out for stage {} at sequence {}",
                    stage, sequence
                );
                return WaitOutcome::TimedOut;
            }
        }
    }
}
