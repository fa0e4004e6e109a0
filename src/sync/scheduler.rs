//! Cooperative trigger scheduler.
//!
//! As an alternative to one free-running thread per stage, a graph may group
//! its stages into executor groups driven by explicit triggers. Each group
//! owns one worker thread and a channel of ticks; triggering a source pushes
//! a tick through the group chain, and every group runs its members once per
//! tick. Members must never block, so a tick flows through the whole chain
//! as a wavefront.

use crate::core::error::{ConfigError, ConfigResult};
use crate::graph::policy::TriggerPolicy;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A unit of work the scheduler can drive.
///
/// `process` must be non-blocking: return `true` when work was attempted or
/// nothing was ready, `false` only on an unrecoverable state.
pub trait SchedulerNode: Send + Sync {
    fn node_name(&self) -> &str;
    fn process(&self, tick: i64) -> bool;
}

enum Tick {
    Run(i64),
    Stop,
}

struct Group {
    name: String,
    trigger_source: String,
    member_names: Vec<String>,
    nodes: Mutex<Vec<Arc<dyn SchedulerNode>>>,
    tx: Sender<Tick>,
    /// Downstream groups triggered after this group's members ran.
    listeners: Mutex<Vec<Arc<Group>>>,
}

impl Group {
    fn run_tick(&self, tick: i64) {
        for node in self.nodes.lock().iter() {
            if !node.process(tick) {
                warn!("group {}: node {} failed tick {}", self.name, node.node_name(), tick);
            }
        }
        for listener in self.listeners.lock().iter() {
            listener.send(tick);
        }
    }

    fn send(&self, tick: i64) {
        if self.tx.send(Tick::Run(tick)).is_err() {
            warn!("group {} is no longer running, tick {} dropped", self.name, tick);
        }
    }
}

/// Drives executor groups built from [`TriggerPolicy`] entries.
pub struct TriggerScheduler {
    groups: Vec<Arc<Group>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Source of ticks for triggers that do not carry one.
    trigger_count: AtomicI64,
}

impl TriggerScheduler {
    /// Build groups from policy, wire source listeners, and start one worker
    /// per group.
    pub fn from_policies(policies: &[TriggerPolicy]) -> ConfigResult<Self> {
        let mut groups: Vec<Arc<Group>> = Vec::with_capacity(policies.len());
        let mut receivers: Vec<(Arc<Group>, Receiver<Tick>)> = Vec::with_capacity(policies.len());

        for policy in policies {
            let (tx, rx) = channel::unbounded();
            let group = Arc::new(Group {
                name: policy.name.clone(),
                trigger_source: policy.trigger_source.clone(),
                member_names: policy.members.clone(),
                nodes: Mutex::new(Vec::new()),
                tx,
                listeners: Mutex::new(Vec::new()),
            });
            groups.push(Arc::clone(&group));
            receivers.push((group, rx));
        }

        // A group naming another group as its trigger source becomes that
        // group's listener; ticks then propagate down the chain.
        for group in &groups {
            if group.trigger_source.is_empty() {
                continue;
            }
            if let Some(source) = groups.iter().find(|g| g.name == group.trigger_source) {
                source.listeners.lock().push(Arc::clone(group));
            }
        }

        let workers = receivers
            .into_iter()
            .map(|(group, rx)| {
                let worker_group = Arc::clone(&group);
                std::thread::Builder::new()
                    .name(format!("sched-{}", group.name))
                    .spawn(move || {
                        while let Ok(Tick::Run(tick)) = rx.recv() {
                            debug!("group {} running tick {}", worker_group.name, tick);
                            worker_group.run_tick(tick);
                        }
                    })
                    .map_err(|e| ConfigError::KernelInit {
                        stage: group.name.clone(),
                        kernel: "scheduler".to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            groups,
            workers: Mutex::new(workers),
            trigger_count: AtomicI64::new(0),
        })
    }

    /// Attach a node to the group whose policy lists it as a member.
    /// Nodes not listed anywhere are left to their own worker threads.
    pub fn register_node(&self, node: Arc<dyn SchedulerNode>) -> bool {
        for group in &self.groups {
            if group.member_names.iter().any(|m| m == node.node_name()) {
                group.nodes.lock().push(node);
                return true;
            }
        }
        false
    }

    /// Stage names claimed by any group.
    pub fn claims(&self, name: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.member_names.iter().any(|m| m == name))
    }

    /// Trigger every group listening to `source`.
    ///
    /// A negative tick means the caller has no sequence to offer; an internal
    /// counter is substituted so downstream ticks stay monotonic.
    pub fn trigger(&self, source: &str, tick: i64) {
        let count = self.trigger_count.fetch_add(1, Ordering::AcqRel) + 1;
        let tick = if tick < 0 { count } else { tick };
        for group in &self.groups {
            if group.trigger_source == source {
                group.send(tick);
            }
        }
    }

    /// Stop all workers. Queued ticks drain first.
    pub fn shutdown(&self) {
        for group in &self.groups {
            let _ = group.tx.send(Tick::Stop);
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TriggerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingNode {
        name: String,
        ticks: Mutex<Vec<i64>>,
        calls: AtomicUsize,
    }

    impl CountingNode {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ticks: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SchedulerNode for CountingNode {
        fn node_name(&self) -> &str {
            &self.name
        }
        fn process(&self, tick: i64) -> bool {
            self.ticks.lock().push(tick);
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn wait_for(node: &CountingNode, calls: usize) {
        for _ in 0..100 {
            if node.calls.load(Ordering::SeqCst) >= calls {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("node {} never reached {} calls", node.name, calls);
    }

    fn chain_policies() -> Vec<TriggerPolicy> {
        vec![
            TriggerPolicy {
                name: "front_group".to_string(),
                trigger_source: String::new(),
                members: vec!["front".to_string()],
            },
            TriggerPolicy {
                name: "post_group".to_string(),
                trigger_source: "front_group".to_string(),
                members: vec!["post".to_string()],
            },
        ]
    }

    #[test]
    fn test_tick_propagates_through_chain() {
        let scheduler = TriggerScheduler::from_policies(&chain_policies()).unwrap();
        let front = CountingNode::new("front");
        let post = CountingNode::new("post");
        assert!(scheduler.register_node(front.clone()));
        assert!(scheduler.register_node(post.clone()));

        scheduler.trigger("", 41);
        wait_for(&front, 1);
        wait_for(&post, 1);
        assert_eq!(front.ticks.lock().as_slice(), &[41]);
        assert_eq!(post.ticks.lock().as_slice(), &[41]);
    }

    #[test]
    fn test_negative_tick_uses_internal_count() {
        let scheduler = TriggerScheduler::from_policies(&chain_policies()).unwrap();
        let front = CountingNode::new("front");
        scheduler.register_node(front.clone());

        scheduler.trigger("", -1);
        scheduler.trigger("", -1);
        wait_for(&front, 2);
        assert_eq!(front.ticks.lock().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_unclaimed_node_is_rejected() {
        let scheduler = TriggerScheduler::from_policies(&chain_policies()).unwrap();
        let other = CountingNode::new("unrelated");
        assert!(!scheduler.register_node(other));
        assert!(scheduler.claims("front"));
        assert!(!scheduler.claims("unrelated"));
    }

    #[test]
    fn test_shutdown_drains_pending_ticks() {
        let scheduler = TriggerScheduler::from_policies(&chain_policies()).unwrap();
        let front = CountingNode::new("front");
        scheduler.register_node(front.clone());
        for i in 0..5 {
            scheduler.trigger("", i);
        }
        scheduler.shutdown();
        assert_eq!(front.calls.load(Ordering::SeqCst), 5);
    }
}
