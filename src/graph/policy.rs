//! Declarative graph policies.
//!
//! A [`GraphPolicy`] is the serializable description of one processing graph:
//! stages, their terminals, the links between terminals, external stream
//! declarations, bundle groupings, and trigger groups. Policies are loaded
//! from TOML files or assembled programmatically, validated up front, and
//! handed to the builder.

use crate::core::error::{PolicyError, PolicyResult};
use crate::core::types::{NotifyOrder, Port, SequenceId, StreamConfig, StreamId, StreamKind};
use crate::graph::terminal::{Direction, TerminalId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One stage of the graph: a named kernel chain on a logical sub-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePolicy {
    pub name: String,
    /// Ordered kernel names, resolved through the session's kernel factory.
    pub kernels: Vec<String>,
    /// Logical sub-stream this stage runs on.
    pub stream_id: StreamId,
    #[serde(default)]
    pub stream_kind: StreamKind,
    #[serde(default)]
    pub notify_order: NotifyOrder,
    /// Whether this stage produces per-frame statistics.
    #[serde(default)]
    pub emits_stats: bool,
}

/// One data endpoint of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSpec {
    pub id: TerminalId,
    pub stage: String,
    pub direction: Direction,
    pub config: StreamConfig,
}

/// A producer-to-consumer edge between two terminals.
///
/// A link from a terminal to itself marks a passthrough loop and is ignored
/// for edge classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkSpec {
    pub from: TerminalId,
    pub to: TerminalId,
}

/// One member of a synchronization bundle and its permitted lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMember {
    pub stage: String,
    /// Pipeline depth of this member. A member may run ahead while its run
    /// count plus depth stays within the bundle's maximum depth, so shallow
    /// members lead deep members by the depth difference.
    pub depth: u32,
}

/// A group of stages that run in bounded-skew lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePolicy {
    pub members: Vec<BundleMember>,
    /// Sequences at or below this value skip the barrier entirely.
    #[serde(default = "default_start_sequence")]
    pub start_sequence: SequenceId,
}

fn default_start_sequence() -> SequenceId {
    -1
}

/// A cooperatively scheduled executor group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPolicy {
    pub name: String,
    /// Name of the trigger source this group listens to. An empty string
    /// means the group is driven directly by frame submission.
    #[serde(default)]
    pub trigger_source: String,
    /// Stage names executed by this group, in order.
    pub members: Vec<String>,
}

/// Complete declarative description of one processing graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphPolicy {
    pub name: String,
    pub stages: Vec<StagePolicy>,
    pub terminals: Vec<TerminalSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    /// External input streams by graph port.
    #[serde(default)]
    pub inputs: IndexMap<Port, StreamConfig>,
    /// External output streams by graph port.
    #[serde(default)]
    pub outputs: IndexMap<Port, StreamConfig>,
    #[serde(default)]
    pub bundles: Vec<BundlePolicy>,
    #[serde(default)]
    pub trigger_groups: Vec<TriggerPolicy>,
}

impl GraphPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load and validate a policy from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> PolicyResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a policy from TOML text.
    pub fn from_toml_str(text: &str) -> PolicyResult<Self> {
        let policy: Self = toml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Serialize to TOML, for persisting generated policies.
    pub fn to_toml_string(&self) -> String {
        // GraphPolicy contains no non-serializable state.
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Parse and validate a policy from JSON text, for tool integration.
    pub fn from_json_str(text: &str) -> PolicyResult<Self> {
        let policy: Self = serde_json::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn stage(&self, name: &str) -> Option<&StagePolicy> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn terminal(&self, id: TerminalId) -> Option<&TerminalSpec> {
        self.terminals.iter().find(|t| t.id == id)
    }

    /// Structural validation, run before any graph construction starts.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.stages.is_empty() {
            return Err(PolicyError::NoStages);
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(PolicyError::DuplicateStage(stage.name.clone()));
            }
            if stage.kernels.is_empty() {
                return Err(PolicyError::EmptyKernelList(stage.name.clone()));
            }
        }

        let mut terminal_ids = HashSet::new();
        for terminal in &self.terminals {
            if !terminal_ids.insert(terminal.id) {
                return Err(PolicyError::DuplicateTerminal(terminal.id));
            }
            if !stage_names.contains(terminal.stage.as_str()) {
                return Err(PolicyError::UnknownTerminalStage {
                    terminal: terminal.id,
                    stage: terminal.stage.clone(),
                });
            }
        }

        for link in &self.links {
            let from = self
                .terminal(link.from)
                .ok_or(PolicyError::UnknownLinkTerminal(link.from))?;
            let to = self
                .terminal(link.to)
                .ok_or(PolicyError::UnknownLinkTerminal(link.to))?;
            // Self-links are passthrough markers, exempt from direction rules.
            if link.from == link.to {
                continue;
            }
            if from.direction != Direction::Output || to.direction != Direction::Input {
                return Err(PolicyError::BadLinkDirection {
                    from: link.from,
                    to: link.to,
                });
            }
        }

        for bundle in &self.bundles {
            for member in &bundle.members {
                if !stage_names.contains(member.stage.as_str()) {
                    return Err(PolicyError::UnknownBundleMember(member.stage.clone()));
                }
            }
        }

        for group in &self.trigger_groups {
            for member in &group.members {
                if !stage_names.contains(member.as_str()) {
                    return Err(PolicyError::UnknownTriggerMember {
                        group: group.name.clone(),
                        member: member.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
