//! Atomic construction of a runnable pipeline graph from a policy.
//!
//! The builder instantiates kernels, assigns ports to terminals, wires
//! producer/consumer links, seeds inter-stage buffer pools, binds external
//! streams, and registers bundles and trigger groups. Any failure aborts the
//! whole build; no partially wired graph ever escapes.

use crate::core::context::SessionContext;
use crate::core::error::{ConfigError, ConfigResult};
use crate::core::stage::KernelFactory;
use crate::core::types::{Port, StreamConfig, StreamId};
use crate::execution::pipeline::{PipelineGraph, PoolSeed, PortMapping};
use crate::execution::queue::StageQueue;
use crate::graph::policy::GraphPolicy;
use crate::graph::terminal::{Direction, TerminalId, TerminalTable};
use crate::sync::barrier::BundleBarrier;
use crate::sync::scheduler::{SchedulerNode, TriggerScheduler};
use indexmap::IndexMap;
use log::{debug, info};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::sync::Arc;

pub struct GraphBuilder;

impl GraphBuilder {
    /// Build a runnable graph. The returned graph is fully wired but not yet
    /// started.
    pub fn build(
        policy: &GraphPolicy,
        factory: &dyn KernelFactory,
        ctx: Arc<SessionContext>,
    ) -> ConfigResult<PipelineGraph> {
        policy.validate()?;
        let mut table = TerminalTable::from_policy(policy)?;

        Self::check_acyclic(policy)?;
        Self::assign_ports(policy, &mut table)?;

        // Instantiate every stage with its kernel chain and edge flags.
        let mut stages: IndexMap<String, Arc<StageQueue>> = IndexMap::new();
        for stage_policy in &policy.stages {
            let kernel = factory.create(&stage_policy.name, &stage_policy.kernels)?;
            let queue = StageQueue::new(
                stage_policy,
                kernel,
                table.is_input_edge(&stage_policy.name),
                table.is_output_edge(&stage_policy.name),
                Arc::clone(&ctx),
            );
            let inputs: IndexMap<Port, StreamConfig> = table
                .stage_terminals(&stage_policy.name, Direction::Input)
                .filter_map(|t| t.port.map(|p| (p, t.config)))
                .collect();
            let outputs: IndexMap<Port, StreamConfig> = table
                .stage_terminals(&stage_policy.name, Direction::Output)
                .filter_map(|t| t.port.map(|p| (p, t.config)))
                .collect();
            queue.set_frame_info(inputs, outputs);
            stages.insert(stage_policy.name.clone(), queue);
        }

        // Producer/consumer wiring. Every internal stage must have exactly
        // one producer stage.
        let mut producers: IndexMap<String, String> = IndexMap::new();
        for name in stages.keys() {
            if let Some(producer) = table.unique_producer(name)? {
                producers.insert(name.clone(), producer);
            }
        }
        for (consumer_name, producer_name) in &producers {
            let consumer = &stages[consumer_name];
            let producer = &stages[producer_name];
            producer.add_consumer(consumer);
            consumer.set_producer(producer);
        }

        let pool_plan = Self::pool_plan(&table);

        let input_maps = Self::bind_inputs(policy, &mut table)?;
        let output_maps = Self::bind_outputs(policy, &mut table)?;
        let stage_streams = Self::stream_chains(&stages, &producers, &output_maps);

        let barrier = Arc::new(BundleBarrier::new(ctx.barrier_wait()));
        for bundle in &policy.bundles {
            let members: Vec<(String, u32)> = bundle
                .members
                .iter()
                .map(|m| (m.stage.clone(), m.depth))
                .collect();
            barrier.add_bundle(&members, bundle.start_sequence);
            for member in &bundle.members {
                if let Some(stage) = stages.get(&member.stage) {
                    stage.set_barrier(Arc::clone(&barrier));
                }
            }
        }

        let scheduler = if policy.trigger_groups.is_empty() {
            None
        } else {
            let scheduler = TriggerScheduler::from_policies(&policy.trigger_groups)?;
            for stage in stages.values() {
                if scheduler.claims(stage.name()) {
                    stage.set_scheduled(true);
                    scheduler.register_node(Arc::clone(stage) as Arc<dyn SchedulerNode>);
                }
            }
            Some(scheduler)
        };

        info!(
            "graph {} built: {} stages, {} input maps, {} output maps",
            policy.name,
            stages.len(),
            input_maps.len(),
            output_maps.len()
        );

        Ok(PipelineGraph::assemble(
            policy.name.clone(),
            ctx,
            stages,
            input_maps,
            output_maps,
            stage_streams,
            pool_plan,
            barrier,
            scheduler,
        ))
    }

    fn check_acyclic(policy: &GraphPolicy) -> ConfigResult<()> {
        let stage_index = |name: &str| policy.stages.iter().position(|s| s.name == name);
        let mut topo: DiGraphMap<usize, ()> = DiGraphMap::new();
        for index in 0..policy.stages.len() {
            topo.add_node(index);
        }
        for link in &policy.links {
            if link.from == link.to {
                continue;
            }
            let from = policy
                .terminal(link.from)
                .and_then(|t| stage_index(&t.stage));
            let to = policy.terminal(link.to).and_then(|t| stage_index(&t.stage));
            if let (Some(from), Some(to)) = (from, to) {
                if from != to {
                    topo.add_edge(from, to, ());
                }
            }
        }
        if let Err(cycle) = toposort(&topo, None) {
            return Err(ConfigError::CycleDetected(
                policy.stages[cycle.node_id()].name.clone(),
            ));
        }
        Ok(())
    }

    /// Default per-stage port assignment, then link overrides so a consumer's
    /// input port equals its producer's output port.
    fn assign_ports(policy: &GraphPolicy, table: &mut TerminalTable) -> ConfigResult<()> {
        for stage in &policy.stages {
            for direction in [Direction::Output, Direction::Input] {
                let ids: Vec<TerminalId> = table
                    .stage_terminals(&stage.name, direction)
                    .map(|t| t.id)
                    .collect();
                for (index, id) in ids.iter().enumerate() {
                    let Some(port) = Port::all().get(index).copied() else {
                        return Err(ConfigError::PortsExhausted {
                            stage: stage.name.clone(),
                            direction: match direction {
                                Direction::Input => "input",
                                Direction::Output => "output",
                            },
                        });
                    };
                    if let Some(terminal) = table.get_mut(*id) {
                        terminal.port = Some(port);
                    }
                }
            }
        }

        let overrides: Vec<(TerminalId, Port)> = policy
            .links
            .iter()
            .filter(|l| l.from != l.to)
            .filter_map(|l| {
                table
                    .get(l.from)
                    .and_then(|from| from.port)
                    .map(|port| (l.to, port))
            })
            .collect();
        for (id, port) in overrides {
            if let Some(terminal) = table.get_mut(id) {
                terminal.port = Some(port);
            }
        }
        Ok(())
    }

    /// Pool plan for every internal link: which producer output FIFO gets
    /// seeded with recyclable buffers, and at what config. Seeding itself
    /// happens on every graph start so a stopped graph can restart clean.
    fn pool_plan(table: &TerminalTable) -> Vec<PoolSeed> {
        let mut plan = Vec::new();
        for terminal in table.iter() {
            if terminal.direction != Direction::Input || terminal.peer.is_none() {
                continue;
            }
            let Some(port) = terminal.port else { continue };
            let producer = terminal.peer.and_then(|id| table.get(id));
            let Some(producer) = producer else { continue };
            debug!(
                "pool on {} of stage {} at {}x{}",
                port, producer.stage, terminal.config.width, terminal.config.height
            );
            plan.push(PoolSeed {
                stage: producer.stage.clone(),
                port,
                config: terminal.config,
            });
        }
        plan
    }

    /// Bind each declared external input stream to the first free compatible
    /// input-edge terminal. Bound terminals are cleared so repeated
    /// declarations land on distinct terminals.
    fn bind_inputs(policy: &GraphPolicy, table: &mut TerminalTable) -> ConfigResult<Vec<PortMapping>> {
        let mut mappings = Vec::new();
        for (graph_port, config) in &policy.inputs {
            let candidate = table
                .iter()
                .find(|t| {
                    t.direction == Direction::Input
                        && t.peer.is_none()
                        && !t.bound
                        && t.port.is_some()
                        && t.config.is_compatible(config, false)
                })
                .map(|t| t.id);
            let Some(id) = candidate else {
                return Err(ConfigError::UnboundPort {
                    port: *graph_port,
                    direction: "input",
                });
            };
            if let Some(terminal) = table.get_mut(id) {
                terminal.bound = true;
                if let Some(stage_port) = terminal.port {
                    mappings.push(PortMapping {
                        stage: terminal.stage.clone(),
                        graph_port: *graph_port,
                        stage_port,
                    });
                }
            }
        }
        Ok(mappings)
    }

    /// Bind each declared external output stream to every output-edge stage
    /// that offers a free compatible terminal. A port bound by two stages is
    /// a branch fork; the tie-break at submission selects one.
    fn bind_outputs(
        policy: &GraphPolicy,
        table: &mut TerminalTable,
    ) -> ConfigResult<Vec<PortMapping>> {
        let mut mappings = Vec::new();
        for (graph_port, config) in &policy.outputs {
            let candidates: Vec<TerminalId> = policy
                .stages
                .iter()
                .filter_map(|stage| {
                    table
                        .stage_terminals(&stage.name, Direction::Output)
                        .find(|t| {
                            t.peer.is_none()
                                && !t.bound
                                && t.port.is_some()
                                && t.config.is_compatible(config, true)
                        })
                        .map(|t| t.id)
                })
                .collect();
            if candidates.is_empty() {
                return Err(ConfigError::UnboundPort {
                    port: *graph_port,
                    direction: "output",
                });
            }
            for id in candidates {
                if let Some(terminal) = table.get_mut(id) {
                    terminal.bound = true;
                    if let Some(stage_port) = terminal.port {
                        mappings.push(PortMapping {
                            stage: terminal.stage.clone(),
                            graph_port: *graph_port,
                            stage_port,
                        });
                    }
                }
            }
        }
        Ok(mappings)
    }

    /// Stream-id chain of each output-bound stage, from the stage itself up
    /// through its producers. Settings preparation walks these chains.
    fn stream_chains(
        stages: &IndexMap<String, Arc<StageQueue>>,
        producers: &IndexMap<String, String>,
        output_maps: &[PortMapping],
    ) -> IndexMap<String, Vec<StreamId>> {
        let mut chains = IndexMap::new();
        for mapping in output_maps {
            if chains.contains_key(&mapping.stage) {
                continue;
            }
            let mut chain = Vec::new();
            let mut current = Some(mapping.stage.clone());
            while let Some(name) = current {
                if let Some(stage) = stages.get(&name) {
                    if !chain.contains(&stage.stream_id()) {
                        chain.push(stage.stream_id());
                    }
                }
                current = producers.get(&name).cloned();
            }
            chains.insert(mapping.stage.clone(), chain);
        }
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::PassthroughFactory;
    use crate::core::types::PixelFormat;
    use crate::graph::policy::tests::linear_policy;
    use crate::graph::policy::{LinkSpec, TerminalSpec};

    fn build(policy: &GraphPolicy) -> ConfigResult<PipelineGraph> {
        GraphBuilder::build(policy, &PassthroughFactory, Arc::new(SessionContext::default()))
    }

    #[test]
    fn test_linear_graph_builds() {
        let graph = build(&linear_policy()).unwrap();
        assert_eq!(graph.input_mappings().len(), 1);
        assert_eq!(graph.output_mappings().len(), 1);
        assert_eq!(graph.input_mappings()[0].stage, "front");
        assert_eq!(graph.output_mappings()[0].stage, "post");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut policy = linear_policy();
        // Give front a second input fed from post's output, closing a loop.
        policy.terminals.push(TerminalSpec {
            id: TerminalId(4),
            stage: "front".to_string(),
            direction: Direction::Input,
            config: StreamConfig::new(1920, 1080, PixelFormat::Nv12),
        });
        policy.links.push(LinkSpec {
            from: TerminalId(3),
            to: TerminalId(4),
        });
        assert!(matches!(
            build(&policy),
            Err(ConfigError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_incompatible_external_input_is_rejected() {
        let mut policy = linear_policy();
        policy
            .inputs
            .insert(Port::Main, StreamConfig::new(640, 480, PixelFormat::Rgb888));
        assert!(matches!(
            build(&policy),
            Err(ConfigError::UnboundPort {
                direction: "input",
                ..
            })
        ));
    }

    #[test]
    fn test_bound_terminal_is_not_reused() {
        // Declaring a second identical output stream must fail once the only
        // compatible terminal is already bound.
        let mut policy = linear_policy();
        let yuv = policy.outputs[&Port::Main];
        policy.outputs.insert(Port::Second, yuv);
        assert!(matches!(
            build(&policy),
            Err(ConfigError::UnboundPort {
                direction: "output",
                ..
            })
        ));
    }

    #[test]
    fn test_binding_is_deterministic() {
        let policy = linear_policy();
        let a = build(&policy).unwrap();
        let b = build(&policy).unwrap();
        assert_eq!(a.input_mappings(), b.input_mappings());
        assert_eq!(a.output_mappings(), b.output_mappings());
    }

    #[test]
    fn test_stream_chain_walks_producers() {
        let graph = build(&linear_policy()).unwrap();
        // post (stream 2) is fed by front (stream 1).
        assert_eq!(graph.stream_chain("post"), Some(&vec![2, 1]));
    }
}
