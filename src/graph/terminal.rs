//! Terminal descriptors and the resolved terminal table.
//!
//! Terminals are the graph-internal endpoints of stages. The builder resolves
//! policy terminals and links into a [`TerminalTable`], assigns each terminal
//! a port, and classifies stages as input-edge or output-edge. After binding,
//! only ports remain visible; terminal identities stay inside this module and
//! the builder.

use crate::core::error::{ConfigError, ConfigResult};
use crate::core::types::{Port, StreamConfig};
use crate::graph::policy::GraphPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Graph-unique terminal identifier, taken verbatim from the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(pub u32);

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Data direction of a terminal, relative to its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// A policy terminal resolved against its links.
#[derive(Debug, Clone)]
pub struct TerminalDescriptor {
    pub id: TerminalId,
    pub stage: String,
    pub direction: Direction,
    pub config: StreamConfig,
    /// For inputs, the producing output terminal. For outputs, the consuming
    /// input terminal. `None` marks an external edge.
    pub peer: Option<TerminalId>,
    /// Port assigned by the builder. `None` until assignment runs.
    pub port: Option<Port>,
    /// Set once an external stream has claimed this terminal.
    pub bound: bool,
}

/// All terminals of one graph, indexed by id, in policy declaration order.
#[derive(Debug, Default)]
pub struct TerminalTable {
    terminals: IndexMap<TerminalId, TerminalDescriptor>,
}

impl TerminalTable {
    /// Resolve a validated policy's terminals and links.
    pub fn from_policy(policy: &GraphPolicy) -> ConfigResult<Self> {
        let mut terminals: IndexMap<TerminalId, TerminalDescriptor> = policy
            .terminals
            .iter()
            .map(|spec| {
                (
                    spec.id,
                    TerminalDescriptor {
                        id: spec.id,
                        stage: spec.stage.clone(),
                        direction: spec.direction,
                        config: spec.config,
                        peer: None,
                        port: None,
                        bound: false,
                    },
                )
            })
            .collect();

        for link in &policy.links {
            if link.from == link.to {
                continue;
            }
            if let Some(from) = terminals.get_mut(&link.from) {
                from.peer = Some(link.to);
            }
            if let Some(to) = terminals.get_mut(&link.to) {
                to.peer = Some(link.from);
            }
        }

        Ok(Self { terminals })
    }

    pub fn get(&self, id: TerminalId) -> Option<&TerminalDescriptor> {
        self.terminals.get(&id)
    }

    pub fn get_mut(&mut self, id: TerminalId) -> Option<&mut TerminalDescriptor> {
        self.terminals.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TerminalDescriptor> {
        self.terminals.values()
    }

    pub fn stage_terminals<'a>(
        &'a self,
        stage: &'a str,
        direction: Direction,
    ) -> impl Iterator<Item = &'a TerminalDescriptor> + 'a {
        self.terminals
            .values()
            .filter(move |t| t.stage == stage && t.direction == direction)
    }

    /// A stage is an input edge when at least one of its input terminals has
    /// no internal producer.
    pub fn is_input_edge(&self, stage: &str) -> bool {
        self.stage_terminals(stage, Direction::Input)
            .any(|t| t.peer.is_none())
    }

    /// A stage is an output edge when at least one of its output terminals
    /// has no internal consumer.
    pub fn is_output_edge(&self, stage: &str) -> bool {
        self.stage_terminals(stage, Direction::Output)
            .any(|t| t.peer.is_none())
    }

    /// Producer stage of `stage`, derived from its input terminals' peers.
    ///
    /// Internal stages must have exactly one producer; zero or several is a
    /// configuration error.
    pub fn unique_producer(&self, stage: &str) -> ConfigResult<Option<String>> {
        let mut producers: Vec<String> = Vec::new();
        for terminal in self.stage_terminals(stage, Direction::Input) {
            let Some(peer_id) = terminal.peer else {
                continue;
            };
            if let Some(peer) = self.get(peer_id) {
                if !producers.contains(&peer.stage) {
                    producers.push(peer.stage.clone());
                }
            }
        }
        match producers.len() {
            0 if self.is_input_edge(stage) => Ok(None),
            0 => Err(ConfigError::MissingProducer(stage.to_string())),
            1 => Ok(Some(producers.remove(0))),
            n => Err(ConfigError::MultipleProducers {
                stage: stage.to_string(),
                count: n,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::policy::tests::linear_policy;
    use crate::graph::policy::LinkSpec;

    #[test]
    fn test_edge_classification() {
        let table = TerminalTable::from_policy(&linear_policy()).unwrap();
        assert!(table.is_input_edge("front"));
        assert!(!table.is_output_edge("front"));
        assert!(!table.is_input_edge("post"));
        assert!(table.is_output_edge("post"));
    }

    #[test]
    fn test_unique_producer_resolution() {
        let table = TerminalTable::from_policy(&linear_policy()).unwrap();
        assert_eq!(table.unique_producer("front").unwrap(), None);
        assert_eq!(
            table.unique_producer("post").unwrap(),
            Some("front".to_string())
        );
    }

    #[test]
    fn test_self_link_does_not_create_peer() {
        let mut policy = linear_policy();
        policy.links.push(LinkSpec {
            from: TerminalId(3),
            to: TerminalId(3),
        });
        let table = TerminalTable::from_policy(&policy).unwrap();
        // The self-link on post's output must not hide its output edge.
        assert!(table.is_output_edge("post"));
    }
}
