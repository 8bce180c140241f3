use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DateTimeUtc, DecisionId, ErrorEnvelope, NodeExecutionId, RunId, WorkflowId};

pub const START_NODE: &str = "__start__";
pub const END_NODE: &str = "__end__";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Single,
    Swarm,
    Parallel,
}

impl NodeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Swarm => "swarm",
            Self::Parallel => "parallel",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single" => Some(Self::Single),
            "swarm" => Some(Self::Swarm),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }
}

/// Fan-out settings. `roles`/`num_ants` drive swarm nodes, `prompts` drive
/// parallel nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub num_ants: Option<usize>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub config: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(deny_unknown_fields)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

impl WorkflowEdge {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub description: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Real node ids feeding `node_id`; sentinels are excluded.
    #[must_use]
    pub fn predecessors(&self, node_id: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|edge| edge.to == node_id && edge.from != START_NODE)
            .map(|edge| edge.from.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Finished runs may be reopened for resubmission.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Completed | Self::Failed)
                | (Self::Completed | Self::Failed, Self::Running)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub phase: Option<String>,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub input: Value,
    pub output: Option<Value>,
    pub context: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl NodeExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecution {
    pub exec_id: NodeExecutionId,
    pub run_id: RunId,
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub agent_id: Option<String>,
    pub status: NodeExecutionStatus,
    pub prompt: String,
    pub result_text: Option<String>,
    pub result: Option<Value>,
    pub findings: Vec<Value>,
    pub files_modified: Vec<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
}

/// Structured output of one node invocation.
///
/// Keys other than `findings`, `files_modified` and `error` are kept in
/// `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    #[serde(default)]
    pub findings: Vec<Value>,
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl NodeResult {
    #[must_use]
    pub fn failed(error: ErrorEnvelope) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Route,
    SkipNode,
    FinishRun,
    Resubmit,
}

impl DecisionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::SkipNode => "skip_node",
            Self::FinishRun => "finish_run",
            Self::Resubmit => "resubmit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "route" => Some(Self::Route),
            "skip_node" => Some(Self::SkipNode),
            "finish_run" => Some(Self::FinishRun),
            "resubmit" => Some(Self::Resubmit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConductorDecision {
    pub decision_id: DecisionId,
    pub run_id: RunId,
    pub node_id: Option<String>,
    pub decision_type: DecisionType,
    pub reason: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}
