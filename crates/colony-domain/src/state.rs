//! Deterministic fold of coordination events into the shared aggregate state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, SequencedEvent};
use crate::ColonyError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Working,
    Blocked,
    Completed,
    Failed,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "working" => Some(Self::Working),
            "blocked" => Some(Self::Blocked),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses only accept a repeat of themselves.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Active | Self::Working | Self::Blocked => true,
            Self::Completed | Self::Failed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Claimed) | (Self::Claimed, Self::Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Open,
    Resolved,
}

impl QuestionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!((self, next), (Self::Open, Self::Resolved))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentState {
    pub agent_id: String,
    pub task: String,
    pub scope: Vec<String>,
    pub interests: Vec<String>,
    pub status: AgentStatus,
    pub cursor: u64,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Finding {
    pub id: String,
    pub seq: u64,
    pub agent_id: String,
    pub finding_type: String,
    pub tags: Vec<String>,
    pub importance: u8,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Message {
    pub id: String,
    pub seq: u64,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub content: String,
    pub read_by: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Task {
    pub id: String,
    pub seq: u64,
    pub description: String,
    pub created_by: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub claimed_by: Option<String>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Question {
    pub id: String,
    pub seq: u64,
    pub agent_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub blocking: bool,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
}

#[must_use]
pub fn finding_id(seq: u64) -> String {
    format!("finding-{seq}")
}

#[must_use]
pub fn question_id(seq: u64) -> String {
    format!("q-{seq}")
}

#[must_use]
pub fn task_id(seq: u64) -> String {
    format!("task-{seq}")
}

#[must_use]
pub fn message_id(seq: u64) -> String {
    format!("msg-{seq}")
}

/// Current shared state derived from the event history. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateState {
    pub agents: BTreeMap<String, AgentState>,
    pub findings: Vec<Finding>,
    pub messages: Vec<Message>,
    pub tasks: Vec<Task>,
    pub questions: Vec<Question>,
    pub context: BTreeMap<String, Value>,
    pub last_seq: u64,
}

/// Counters describing one projection pass over a log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScanReport {
    pub applied: usize,
    pub rejected: usize,
    pub corrupt: usize,
    pub unknown: usize,
}

impl AggregateState {
    /// Fold one event into the state.
    ///
    /// A rejected event leaves every collection untouched; only `last_seq`
    /// advances.
    ///
    /// # Errors
    /// Returns [`ColonyError::InvalidTransition`] when the event references an
    /// unknown entity or requests a status change the transition table forbids.
    #[allow(clippy::too_many_lines)]
    pub fn apply(&mut self, seq: u64, event: &Event) -> Result<(), ColonyError> {
        self.last_seq = self.last_seq.max(seq);

        match event {
            Event::AgentRegistered(payload) => {
                self.agents.insert(
                    payload.agent_id.clone(),
                    AgentState {
                        agent_id: payload.agent_id.clone(),
                        task: payload.task.clone(),
                        scope: payload.scope.clone(),
                        interests: payload.interests.clone(),
                        status: AgentStatus::Active,
                        cursor: 0,
                        result: None,
                    },
                );
            }
            Event::AgentStatusUpdated(payload) => {
                let agent = self.agent_mut(&payload.agent_id)?;
                if !agent.status.can_transition_to(payload.status) {
                    return Err(ColonyError::InvalidTransition(format!(
                        "agent {} cannot move from {} to {}",
                        payload.agent_id,
                        agent.status.as_str(),
                        payload.status.as_str()
                    )));
                }
                agent.status = payload.status;
                if payload.result.is_some() {
                    agent.result.clone_from(&payload.result);
                }
            }
            Event::AgentCursorUpdated(payload) => {
                self.agent_mut(&payload.agent_id)?.cursor = seq;
            }
            Event::FindingAdded(payload) => {
                self.findings.push(Finding {
                    id: finding_id(seq),
                    seq,
                    agent_id: payload.agent_id.clone(),
                    finding_type: payload.finding_type.clone(),
                    tags: payload.tags.clone(),
                    importance: payload.importance,
                    content: payload.content.clone(),
                });
            }
            Event::MessageSent(payload) => {
                self.messages.push(Message {
                    id: message_id(seq),
                    seq,
                    from_agent: payload.from_agent.clone(),
                    to_agent: payload.to_agent.clone(),
                    content: payload.content.clone(),
                    read_by: BTreeSet::new(),
                });
            }
            Event::MessageRead(payload) => {
                let message = self
                    .messages
                    .iter_mut()
                    .find(|message| message.id == payload.message_id)
                    .ok_or_else(|| unknown("message", &payload.message_id))?;
                message.read_by.insert(payload.agent_id.clone());
            }
            Event::TaskAdded(payload) => {
                self.tasks.push(Task {
                    id: task_id(seq),
                    seq,
                    description: payload.description.clone(),
                    created_by: payload.created_by.clone(),
                    priority: payload.priority,
                    status: TaskStatus::Pending,
                    claimed_by: None,
                    result: None,
                });
            }
            Event::TaskClaimed(payload) => {
                let task = self.task_mut(&payload.task_id, TaskStatus::Claimed)?;
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(payload.agent_id.clone());
            }
            Event::TaskCompleted(payload) => {
                let task = self.task_mut(&payload.task_id, TaskStatus::Completed)?;
                task.status = TaskStatus::Completed;
                task.result.clone_from(&payload.result);
            }
            Event::QuestionAsked(payload) => {
                self.questions.push(Question {
                    id: question_id(seq),
                    seq,
                    agent_id: payload.agent_id.clone(),
                    question: payload.question.clone(),
                    options: payload.options.clone(),
                    blocking: payload.blocking,
                    status: QuestionStatus::Open,
                    answer: None,
                    answered_by: None,
                });
            }
            Event::QuestionAnswered(payload) => {
                let question = self
                    .questions
                    .iter_mut()
                    .find(|question| question.id == payload.question_id)
                    .ok_or_else(|| unknown("question", &payload.question_id))?;
                if !question.status.can_transition_to(QuestionStatus::Resolved) {
                    return Err(ColonyError::InvalidTransition(format!(
                        "question {} is already {}",
                        question.id,
                        question.status.as_str()
                    )));
                }
                question.status = QuestionStatus::Resolved;
                question.answer = Some(payload.answer.clone());
                question.answered_by = Some(payload.answered_by.clone());
            }
            Event::ContextSet(payload) => {
                self.context
                    .insert(payload.key.clone(), payload.value.clone());
            }
            Event::SystemReset(_) => {
                self.agents.clear();
                self.findings.clear();
                self.messages.clear();
                self.tasks.clear();
                self.questions.clear();
                self.context.clear();
            }
        }

        Ok(())
    }

    /// Findings recorded strictly after `cursor`, in seq order.
    #[must_use]
    pub fn findings_since(&self, cursor: u64) -> Vec<Finding> {
        self.findings
            .iter()
            .filter(|finding| finding.seq > cursor)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn agent_ids(&self) -> BTreeSet<String> {
        self.agents.keys().cloned().collect()
    }

    #[must_use]
    pub fn finding_ids(&self) -> BTreeSet<String> {
        self.findings.iter().map(|item| item.id.clone()).collect()
    }

    #[must_use]
    pub fn question_ids(&self) -> BTreeSet<String> {
        self.questions.iter().map(|item| item.id.clone()).collect()
    }

    #[must_use]
    pub fn task_ids(&self) -> BTreeSet<String> {
        self.tasks.iter().map(|item| item.id.clone()).collect()
    }

    fn agent_mut(&mut self, agent_id: &str) -> Result<&mut AgentState, ColonyError> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| unknown("agent", agent_id))
    }

    fn task_mut(&mut self, id: &str, next: TaskStatus) -> Result<&mut Task, ColonyError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| unknown("task", id))?;
        if !task.status.can_transition_to(next) {
            return Err(ColonyError::InvalidTransition(format!(
                "task {id} cannot move from {} to {}",
                task.status.as_str(),
                next.as_str()
            )));
        }
        Ok(task)
    }
}

fn unknown(entity: &str, id: &str) -> ColonyError {
    ColonyError::InvalidTransition(format!("{entity} {id} does not exist"))
}

/// Fold an ordered event stream from the empty state.
///
/// Rejected transitions are counted in the report and never abort the fold.
pub fn project<'a, I>(events: I) -> (AggregateState, ScanReport)
where
    I: IntoIterator<Item = &'a SequencedEvent>,
{
    let mut state = AggregateState::default();
    let mut report = ScanReport::default();
    for item in events {
        match state.apply(item.seq, &item.event) {
            Ok(()) => report.applied += 1,
            Err(_) => report.rejected += 1,
        }
    }
    (state, report)
}

#[cfg(test)]
mod tests {
    use super::{project, AgentStatus, QuestionStatus, TaskStatus};
    use crate::event::{
        AgentCursorUpdated, AgentRegistered, AgentStatusUpdated, ContextSet, Event, FindingAdded,
        MessageRead, MessageSent, QuestionAnswered, QuestionAsked, SequencedEvent, SystemReset,
        TaskAdded, TaskClaimed, TaskCompleted,
    };
    use proptest::prelude::*;
    use serde_json::json;

    fn at(seq: u64, event: Event) -> SequencedEvent {
        SequencedEvent {
            seq,
            timestamp: "2026-02-07T12:00:00Z".to_string(),
            event,
        }
    }

    fn register(agent_id: &str) -> Event {
        Event::AgentRegistered(AgentRegistered {
            agent_id: agent_id.to_string(),
            task: "audit auth".to_string(),
            scope: vec!["src/auth".to_string()],
            interests: vec!["security".to_string()],
        })
    }

    fn finding(agent_id: &str, content: &str) -> Event {
        Event::FindingAdded(FindingAdded {
            agent_id: agent_id.to_string(),
            finding_type: "bug".to_string(),
            tags: Vec::new(),
            importance: 5,
            content: content.to_string(),
        })
    }

    #[test]
    fn folding_rules_build_every_collection() {
        let events = vec![
            at(1, register("a1")),
            at(2, finding("a1", "weak hash")),
            at(
                3,
                Event::MessageSent(MessageSent {
                    from_agent: "a1".to_string(),
                    to_agent: None,
                    content: "look at login".to_string(),
                }),
            ),
            at(
                4,
                Event::MessageRead(MessageRead {
                    message_id: "msg-3".to_string(),
                    agent_id: "a2".to_string(),
                }),
            ),
            at(
                5,
                Event::TaskAdded(TaskAdded {
                    description: "patch hash".to_string(),
                    created_by: "a1".to_string(),
                    priority: 2,
                }),
            ),
            at(
                6,
                Event::TaskClaimed(TaskClaimed {
                    task_id: "task-5".to_string(),
                    agent_id: "a1".to_string(),
                }),
            ),
            at(
                7,
                Event::TaskCompleted(TaskCompleted {
                    task_id: "task-5".to_string(),
                    agent_id: "a1".to_string(),
                    result: Some("done".to_string()),
                }),
            ),
            at(
                8,
                Event::QuestionAsked(QuestionAsked {
                    agent_id: "a1".to_string(),
                    question: "bcrypt or argon2?".to_string(),
                    options: vec!["bcrypt".to_string(), "argon2".to_string()],
                    blocking: true,
                }),
            ),
            at(
                9,
                Event::QuestionAnswered(QuestionAnswered {
                    question_id: "q-8".to_string(),
                    answer: "argon2".to_string(),
                    answered_by: "lead".to_string(),
                }),
            ),
            at(
                10,
                Event::ContextSet(ContextSet {
                    key: "phase".to_string(),
                    value: json!("review"),
                }),
            ),
            at(
                11,
                Event::AgentCursorUpdated(AgentCursorUpdated {
                    agent_id: "a1".to_string(),
                }),
            ),
            at(
                12,
                Event::AgentStatusUpdated(AgentStatusUpdated {
                    agent_id: "a1".to_string(),
                    status: AgentStatus::Completed,
                    result: Some("audit finished".to_string()),
                }),
            ),
        ];

        let (state, report) = project(&events);
        assert_eq!(report.applied, 12);
        assert_eq!(report.rejected, 0);
        assert_eq!(state.last_seq, 12);

        let agent = state.agents.get("a1").unwrap_or_else(|| unreachable!());
        assert_eq!(agent.cursor, 11);
        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(state.findings[0].id, "finding-2");
        assert!(state.messages[0].read_by.contains("a2"));
        assert_eq!(state.tasks[0].status, TaskStatus::Completed);
        assert_eq!(state.questions[0].status, QuestionStatus::Resolved);
        assert_eq!(state.questions[0].answer.as_deref(), Some("argon2"));
        assert_eq!(state.context.get("phase"), Some(&json!("review")));
    }

    #[test]
    fn invalid_transitions_are_rejected_without_side_effects() {
        let events = vec![
            at(
                1,
                Event::TaskAdded(TaskAdded {
                    description: "t".to_string(),
                    created_by: "a1".to_string(),
                    priority: 0,
                }),
            ),
            at(
                2,
                Event::TaskCompleted(TaskCompleted {
                    task_id: "task-1".to_string(),
                    agent_id: "a1".to_string(),
                    result: None,
                }),
            ),
            at(
                3,
                Event::QuestionAnswered(QuestionAnswered {
                    question_id: "q-404".to_string(),
                    answer: "x".to_string(),
                    answered_by: "a1".to_string(),
                }),
            ),
        ];

        let (state, report) = project(&events);
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected, 2);
        assert_eq!(state.tasks[0].status, TaskStatus::Pending);
        assert_eq!(state.last_seq, 3);
    }

    #[test]
    fn reset_clears_everything_but_keeps_position() {
        let events = vec![
            at(1, register("a1")),
            at(2, finding("a1", "x")),
            at(3, Event::SystemReset(SystemReset::default())),
            at(4, finding("a1", "y")),
        ];
        let (state, _) = project(&events);
        assert!(state.agents.is_empty());
        assert_eq!(state.findings.len(), 1);
        assert_eq!(state.findings[0].id, "finding-4");
        assert_eq!(state.last_seq, 4);
    }

    #[test]
    fn findings_since_is_strictly_after_cursor() {
        let events: Vec<SequencedEvent> = (1..=5)
            .map(|seq| at(seq, finding("a1", &format!("f{seq}"))))
            .collect();
        let (state, _) = project(&events);
        let ids: Vec<String> = state.findings_since(2).into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["finding-3", "finding-4", "finding-5"]);
        assert!(state.findings_since(5).is_empty());
    }

    fn event_from_code(code: u8, seq: u64) -> Event {
        match code {
            0 => register(&format!("a{}", seq % 3)),
            1 => finding("a0", "f"),
            2 => Event::TaskAdded(TaskAdded {
                description: "t".to_string(),
                created_by: "a0".to_string(),
                priority: 0,
            }),
            3 => Event::TaskClaimed(TaskClaimed {
                task_id: format!("task-{}", seq.saturating_sub(1)),
                agent_id: "a0".to_string(),
            }),
            _ => Event::AgentCursorUpdated(AgentCursorUpdated {
                agent_id: "a0".to_string(),
            }),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_projection_is_deterministic(codes in prop::collection::vec(0u8..5, 1..60)) {
            let events: Vec<SequencedEvent> = codes
                .iter()
                .enumerate()
                .map(|(index, code)| {
                    let seq = u64::try_from(index).unwrap_or(u64::MAX) + 1;
                    at(seq, event_from_code(*code, seq))
                })
                .collect();

            let (first, first_report) = project(&events);
            let (second, second_report) = project(&events);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first_report, second_report);
            prop_assert_eq!(first_report.applied + first_report.rejected, events.len());
        }
    }
}
