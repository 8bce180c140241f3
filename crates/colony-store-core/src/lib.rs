#![forbid(unsafe_code)]

use anyhow::Result;
use colony_domain::{
    AgentRegistered, AgentState, AgentStatusUpdated, AggregateState, ConductorDecision, Finding,
    FindingAdded, HotSpot, Message, MessageRead, MessageSent, NewTrail, NodeExecution,
    NodeExecutionId, Question, QuestionAnswered, QuestionAsked, RunId, RunStatus, Task, TaskAdded,
    TaskClaimed, TaskCompleted, Trail, TrailQuery, WorkflowDefinition, WorkflowRun,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal payload for a successful node execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeCompletion {
    pub result_text: String,
    pub result: Option<Value>,
    pub findings: Vec<Value>,
    pub files_modified: Vec<String>,
    pub agent_id: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Terminal payload for a failed node execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeFailure {
    pub error_message: String,
    pub error_type: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Persistence for workflow definitions, runs, node executions and the
/// conductor's decision audit trail.
pub trait ConductorStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Fails with `Conflict` when the name is already taken.
    #[allow(clippy::missing_errors_doc)]
    fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &WorkflowRun) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<WorkflowRun>>;

    /// Applies the run status transition table; `output` is kept when given.
    #[allow(clippy::missing_errors_doc)]
    fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<&Value>,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_run_phase(&self, run_id: RunId, phase: &str) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_node_execution(&self, execution: &NodeExecution) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_node_execution(&self, exec_id: NodeExecutionId) -> Result<Option<NodeExecution>>;

    /// Marks the execution completed and bumps the run's completed and total
    /// counters atomically.
    #[allow(clippy::missing_errors_doc)]
    fn complete_node_execution(
        &self,
        exec_id: NodeExecutionId,
        completion: &NodeCompletion,
    ) -> Result<()>;

    /// Marks the execution failed and bumps the run's failed and total
    /// counters atomically.
    #[allow(clippy::missing_errors_doc)]
    fn fail_node_execution(&self, exec_id: NodeExecutionId, failure: &NodeFailure) -> Result<()>;

    /// Ordered by creation time, ties broken by insertion order.
    #[allow(clippy::missing_errors_doc)]
    fn list_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_decision(&self, decision: &ConductorDecision) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_decisions(&self, run_id: RunId) -> Result<Vec<ConductorDecision>>;
}

pub trait TrailStore {
    #[allow(clippy::missing_errors_doc)]
    fn lay_trail(&self, trail: &NewTrail) -> Result<Trail>;

    #[allow(clippy::missing_errors_doc)]
    fn get_trails(&self, query: &TrailQuery) -> Result<Vec<Trail>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_hot_spots(&self, run_id: Option<RunId>) -> Result<Vec<HotSpot>>;

    /// Multiplies every strength by `1 - decay_rate` and returns the rows touched.
    #[allow(clippy::missing_errors_doc)]
    fn decay_trails(&self, decay_rate: f64) -> Result<usize>;
}

/// The mutable coordination store callers used before the event log existed.
///
/// Entity ids derived from event sequence numbers are supplied by the caller
/// so both stores agree on them.
pub trait LegacyStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn register_agent(&self, input: &AgentRegistered) -> Result<AgentState>;

    #[allow(clippy::missing_errors_doc)]
    fn update_agent_status(&self, input: &AgentStatusUpdated) -> Result<AgentState>;

    #[allow(clippy::missing_errors_doc)]
    fn update_cursor(&self, agent_id: &str, cursor: u64) -> Result<AgentState>;

    #[allow(clippy::missing_errors_doc)]
    fn add_finding(&self, seq: u64, input: &FindingAdded) -> Result<Finding>;

    #[allow(clippy::missing_errors_doc)]
    fn send_message(&self, seq: u64, input: &MessageSent) -> Result<Message>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_message_read(&self, input: &MessageRead) -> Result<Message>;

    #[allow(clippy::missing_errors_doc)]
    fn add_task(&self, seq: u64, input: &TaskAdded) -> Result<Task>;

    #[allow(clippy::missing_errors_doc)]
    fn claim_task(&self, input: &TaskClaimed) -> Result<Task>;

    #[allow(clippy::missing_errors_doc)]
    fn complete_task(&self, input: &TaskCompleted) -> Result<Task>;

    #[allow(clippy::missing_errors_doc)]
    fn ask_question(&self, seq: u64, input: &QuestionAsked) -> Result<Question>;

    #[allow(clippy::missing_errors_doc)]
    fn answer_question(&self, input: &QuestionAnswered) -> Result<Question>;

    #[allow(clippy::missing_errors_doc)]
    fn set_context(&self, key: &str, value: &Value) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn reset(&self) -> Result<()>;

    /// Current contents in the same shape the event projection produces.
    /// `last_seq` is the highest entity seq the store has seen.
    #[allow(clippy::missing_errors_doc)]
    fn load_state(&self) -> Result<AggregateState>;
}
