#![forbid(unsafe_code)]

mod config;
mod error;
mod event;
mod state;
mod trail;
mod validation;
mod workflow;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub use config::ColonyConfig;
pub use error::{ColonyError, ErrorEnvelope, ErrorKind};
pub use event::{
    compute_checksum, AgentCursorUpdated, AgentRegistered, AgentStatusUpdated, ContextSet,
    DecodedRecord, Event, EventRecord, EventType, FindingAdded, MessageRead, MessageSent,
    QuestionAnswered, QuestionAsked, SequencedEvent, SystemReset, TaskAdded, TaskClaimed,
    TaskCompleted,
};
pub use state::{
    finding_id, message_id, project, question_id, task_id, AgentState, AgentStatus,
    AggregateState, Finding, Message, Question, QuestionStatus, ScanReport, Task, TaskStatus,
};
pub use trail::{HotSpot, LocationType, NewTrail, Scent, Trail, TrailQuery};
pub use validation::{
    validate_identifier, validate_optional_identifier, validate_unit_interval,
    MAX_IDENTIFIER_LEN,
};
pub use workflow::{
    ConductorDecision, DecisionType, NodeConfig, NodeExecution,
    NodeExecutionStatus, NodeResult, NodeType, RunStatus, WorkflowDefinition, WorkflowEdge,
    WorkflowNode, WorkflowRun, END_NODE, START_NODE,
};

pub type DateTimeUtc = OffsetDateTime;

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`ColonyError::Validation`] when the value is not a ULID.
            pub fn parse(value: &str) -> Result<Self, ColonyError> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    ColonyError::Validation(format!(
                        "invalid {} ULID '{value}': {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(WorkflowId);
ulid_id!(RunId);
ulid_id!(NodeExecutionId);
ulid_id!(TrailId);
ulid_id!(DecisionId);

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`ColonyError::Validation`] when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), ColonyError> {
    if value.trim().is_empty() {
        return Err(ColonyError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// # Errors
/// Returns [`ColonyError::Validation`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, ColonyError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ColonyError::Validation(format!("invalid datetime format: {err}")))
}

/// # Errors
/// Returns [`ColonyError::Validation`] if the value is not RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc, ColonyError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ColonyError::Validation(format!("invalid RFC3339 datetime: {err}")))
}
