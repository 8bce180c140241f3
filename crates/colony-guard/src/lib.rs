#![forbid(unsafe_code)]

//! Dual-write adapter that moves callers from the legacy mutable store onto
//! the event log.
//!
//! Every mutation is appended to the event log first and then applied to the
//! legacy store, which stays the source of truth for reads. A failed log write
//! marks the guard unhealthy; while unhealthy all writes are refused until
//! [`ConsistencyGuard::validate_state_consistency`] has run.

use std::collections::BTreeSet;

use anyhow::Result;
use colony_domain::{
    ensure_non_empty, now_utc, validate_identifier, validate_optional_identifier,
    AgentCursorUpdated, AgentRegistered, AgentState, AgentStatus, AgentStatusUpdated,
    AggregateState, ColonyConfig, ColonyError, ContextSet, DateTimeUtc, Event, Finding,
    FindingAdded, Message, MessageRead, MessageSent, Question, QuestionAnswered, QuestionAsked,
    SystemReset, Task, TaskAdded, TaskClaimed, TaskCompleted,
};
use colony_eventlog::EventLog;
use colony_store_core::LegacyStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GuardHealth {
    #[default]
    Healthy,
    Unhealthy,
}

/// Inputs that move the health state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HealthSignal {
    EventLogWriteFailed,
    Validated,
}

impl GuardHealth {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }

    #[must_use]
    pub fn on(self, signal: HealthSignal) -> Self {
        match (self, signal) {
            (_, HealthSignal::EventLogWriteFailed) => Self::Unhealthy,
            (_, HealthSignal::Validated) => Self::Healthy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Finding,
    Question,
    Task,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Finding => "finding",
            Self::Question => "question",
            Self::Task => "task",
        }
    }
}

/// Ids present in only one of the two stores for one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Divergence {
    pub entity: EntityKind,
    pub missing_in_event_log: Vec<String>,
    pub missing_in_legacy: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyReport {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: DateTimeUtc,
    pub event_log_seq: u64,
    pub legacy_seq: u64,
    pub divergences: Vec<Divergence>,
    pub health_before: GuardHealth,
    pub health_after: GuardHealth,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }

    #[must_use]
    pub fn divergence_for(&self, entity: EntityKind) -> Option<&Divergence> {
        self.divergences.iter().find(|item| item.entity == entity)
    }
}

pub struct ConsistencyGuard<L: LegacyStore> {
    event_log: EventLog,
    legacy: L,
    health: GuardHealth,
    validation_interval: u64,
    log_divergence: bool,
    writes_since_validation: u64,
    last_error: Option<String>,
}

impl<L: LegacyStore> ConsistencyGuard<L> {
    #[must_use]
    pub fn new(event_log: EventLog, legacy: L, config: &ColonyConfig) -> Self {
        Self {
            event_log,
            legacy,
            health: GuardHealth::Healthy,
            validation_interval: config.validation_interval,
            log_divergence: config.log_divergence,
            writes_since_validation: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn health(&self) -> GuardHealth {
        self.health
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health == GuardHealth::Healthy
    }

    /// Message of the event log failure that made the guard unhealthy.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn legacy(&self) -> &L {
        &self.legacy
    }

    pub fn event_log_mut(&mut self) -> &mut EventLog {
        &mut self.event_log
    }

    /// Reads come from the legacy store.
    ///
    /// # Errors
    /// Returns an error if the legacy store cannot be read.
    pub fn get_state(&self) -> Result<AggregateState> {
        self.legacy.load_state()
    }

    /// # Errors
    /// Returns `Validation` for bad input, `Storage` when unhealthy or when the
    /// event log write fails, or the legacy store error.
    pub fn register_agent(&mut self, input: AgentRegistered) -> Result<AgentState> {
        validate_identifier("agent_id", &input.agent_id)?;
        ensure_non_empty("task", &input.task)?;
        let event = Event::AgentRegistered(input.clone());
        self.dual_write(event, |legacy, _seq| legacy.register_agent(&input))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn update_agent_status(
        &mut self,
        agent_id: &str,
        status: AgentStatus,
        result: Option<String>,
    ) -> Result<AgentState> {
        validate_identifier("agent_id", agent_id)?;
        let payload = AgentStatusUpdated {
            agent_id: agent_id.to_string(),
            status,
            result,
        };
        let event = Event::AgentStatusUpdated(payload.clone());
        self.dual_write(event, |legacy, _seq| legacy.update_agent_status(&payload))
    }

    /// Move the agent's cursor to the seq of the cursor event itself.
    ///
    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn update_cursor(&mut self, agent_id: &str) -> Result<AgentState> {
        validate_identifier("agent_id", agent_id)?;
        let event = Event::AgentCursorUpdated(AgentCursorUpdated {
            agent_id: agent_id.to_string(),
        });
        self.dual_write(event, |legacy, seq| legacy.update_cursor(agent_id, seq))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn add_finding(&mut self, input: FindingAdded) -> Result<Finding> {
        validate_identifier("agent_id", &input.agent_id)?;
        ensure_non_empty("finding_type", &input.finding_type)?;
        ensure_non_empty("content", &input.content)?;
        if !(1..=10).contains(&input.importance) {
            return Err(ColonyError::Validation(format!(
                "importance MUST be within 1..=10, got {}",
                input.importance
            ))
            .into());
        }
        let event = Event::FindingAdded(input.clone());
        self.dual_write(event, |legacy, seq| legacy.add_finding(seq, &input))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn send_message(&mut self, input: MessageSent) -> Result<Message> {
        validate_identifier("from_agent", &input.from_agent)?;
        validate_optional_identifier("to_agent", input.to_agent.as_deref())?;
        ensure_non_empty("content", &input.content)?;
        let event = Event::MessageSent(input.clone());
        self.dual_write(event, |legacy, seq| legacy.send_message(seq, &input))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn mark_message_read(&mut self, message_id: &str, agent_id: &str) -> Result<Message> {
        validate_identifier("message_id", message_id)?;
        validate_identifier("agent_id", agent_id)?;
        let payload = MessageRead {
            message_id: message_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        let event = Event::MessageRead(payload.clone());
        self.dual_write(event, |legacy, _seq| legacy.mark_message_read(&payload))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn add_task(&mut self, input: TaskAdded) -> Result<Task> {
        validate_identifier("created_by", &input.created_by)?;
        ensure_non_empty("description", &input.description)?;
        let event = Event::TaskAdded(input.clone());
        self.dual_write(event, |legacy, seq| legacy.add_task(seq, &input))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn claim_task(&mut self, task_id: &str, agent_id: &str) -> Result<Task> {
        validate_identifier("task_id", task_id)?;
        validate_identifier("agent_id", agent_id)?;
        let payload = TaskClaimed {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        let event = Event::TaskClaimed(payload.clone());
        self.dual_write(event, |legacy, _seq| legacy.claim_task(&payload))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn complete_task(
        &mut self,
        task_id: &str,
        agent_id: &str,
        result: Option<String>,
    ) -> Result<Task> {
        validate_identifier("task_id", task_id)?;
        validate_identifier("agent_id", agent_id)?;
        let payload = TaskCompleted {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            result,
        };
        let event = Event::TaskCompleted(payload.clone());
        self.dual_write(event, |legacy, _seq| legacy.complete_task(&payload))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn ask_question(&mut self, input: QuestionAsked) -> Result<Question> {
        validate_identifier("agent_id", &input.agent_id)?;
        ensure_non_empty("question", &input.question)?;
        let event = Event::QuestionAsked(input.clone());
        self.dual_write(event, |legacy, seq| legacy.ask_question(seq, &input))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn answer_question(
        &mut self,
        question_id: &str,
        answer: &str,
        answered_by: &str,
    ) -> Result<Question> {
        validate_identifier("question_id", question_id)?;
        validate_identifier("answered_by", answered_by)?;
        ensure_non_empty("answer", answer)?;
        let payload = QuestionAnswered {
            question_id: question_id.to_string(),
            answer: answer.to_string(),
            answered_by: answered_by.to_string(),
        };
        let event = Event::QuestionAnswered(payload.clone());
        self.dual_write(event, |legacy, _seq| legacy.answer_question(&payload))
    }

    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn set_context(&mut self, key: &str, value: Value) -> Result<()> {
        validate_identifier("context_key", key)?;
        let event = Event::ContextSet(ContextSet {
            key: key.to_string(),
            value: value.clone(),
        });
        self.dual_write(event, |legacy, _seq| legacy.set_context(key, &value))
    }

    /// Clear derived state in both stores. The log keeps its history.
    ///
    /// # Errors
    /// See [`ConsistencyGuard::register_agent`].
    pub fn reset(&mut self, reason: Option<String>) -> Result<()> {
        let event = Event::SystemReset(SystemReset { reason });
        self.dual_write(event, |legacy, _seq| legacy.reset())
    }

    /// Route a typed event to the matching operation and return the legacy
    /// store's view of the result.
    ///
    /// # Errors
    /// Same as the operation the event maps to.
    pub fn apply(&mut self, event: Event) -> Result<Value> {
        let value = match event {
            Event::AgentRegistered(payload) => serde_json::to_value(self.register_agent(payload)?)?,
            Event::AgentStatusUpdated(payload) => serde_json::to_value(self.update_agent_status(
                &payload.agent_id,
                payload.status,
                payload.result,
            )?)?,
            Event::AgentCursorUpdated(payload) => {
                serde_json::to_value(self.update_cursor(&payload.agent_id)?)?
            }
            Event::FindingAdded(payload) => serde_json::to_value(self.add_finding(payload)?)?,
            Event::MessageSent(payload) => serde_json::to_value(self.send_message(payload)?)?,
            Event::MessageRead(payload) => serde_json::to_value(
                self.mark_message_read(&payload.message_id, &payload.agent_id)?,
            )?,
            Event::TaskAdded(payload) => serde_json::to_value(self.add_task(payload)?)?,
            Event::TaskClaimed(payload) => {
                serde_json::to_value(self.claim_task(&payload.task_id, &payload.agent_id)?)?
            }
            Event::TaskCompleted(payload) => serde_json::to_value(self.complete_task(
                &payload.task_id,
                &payload.agent_id,
                payload.result,
            )?)?,
            Event::QuestionAsked(payload) => serde_json::to_value(self.ask_question(payload)?)?,
            Event::QuestionAnswered(payload) => serde_json::to_value(self.answer_question(
                &payload.question_id,
                &payload.answer,
                &payload.answered_by,
            )?)?,
            Event::ContextSet(ContextSet { key, value }) => {
                self.set_context(&key, value.clone())?;
                json!({ "key": key, "value": value })
            }
            Event::SystemReset(SystemReset { reason }) => {
                self.reset(reason.clone())?;
                json!({ "reset": true, "reason": reason })
            }
        };
        Ok(value)
    }

    /// Compare entity id sets between the projected log and the legacy store.
    ///
    /// Divergence is reported, never returned as an error. The legacy store
    /// stays authoritative and the guard returns to healthy.
    ///
    /// # Errors
    /// Returns an error only when either store cannot be read.
    pub fn validate_state_consistency(&mut self) -> Result<ConsistencyReport> {
        let projected = self.event_log.get_current_state()?;
        let legacy = self.legacy.load_state()?;

        let divergences: Vec<Divergence> = [
            (EntityKind::Agent, projected.agent_ids(), legacy.agent_ids()),
            (
                EntityKind::Finding,
                projected.finding_ids(),
                legacy.finding_ids(),
            ),
            (
                EntityKind::Question,
                projected.question_ids(),
                legacy.question_ids(),
            ),
            (EntityKind::Task, projected.task_ids(), legacy.task_ids()),
        ]
        .into_iter()
        .filter_map(|(entity, in_log, in_legacy)| diverge(entity, &in_log, &in_legacy))
        .collect();

        if self.log_divergence {
            for divergence in &divergences {
                tracing::warn!(
                    entity = divergence.entity.as_str(),
                    missing_in_event_log = ?divergence.missing_in_event_log,
                    missing_in_legacy = ?divergence.missing_in_legacy,
                    "event log and legacy store diverge; legacy store remains authoritative"
                );
            }
        }

        let health_before = self.health;
        self.health = self.health.on(HealthSignal::Validated);
        self.writes_since_validation = 0;
        if health_before != self.health {
            self.last_error = None;
            tracing::info!("consistency guard healthy again; writes resume");
        }

        Ok(ConsistencyReport {
            checked_at: now_utc(),
            event_log_seq: projected.last_seq,
            legacy_seq: legacy.last_seq,
            divergences,
            health_before,
            health_after: self.health,
        })
    }

    fn dual_write<T>(
        &mut self,
        event: Event,
        apply_legacy: impl FnOnce(&L, u64) -> Result<T>,
    ) -> Result<T> {
        if self.health == GuardHealth::Unhealthy {
            return Err(ColonyError::Storage(format!(
                "consistency guard is unhealthy, refusing {}: {}",
                event.event_type().as_str(),
                self.last_error.as_deref().unwrap_or("event log write failed")
            ))
            .into());
        }

        let seq = match self.event_log.append_event(&event) {
            Ok(seq) => seq,
            Err(err) => {
                self.health = self.health.on(HealthSignal::EventLogWriteFailed);
                self.last_error = Some(format!("{err:#}"));
                tracing::error!(
                    event_type = event.event_type().as_str(),
                    error = %format!("{err:#}"),
                    "event log write failed; guard is now unhealthy"
                );
                return Err(err);
            }
        };

        let value = apply_legacy(&self.legacy, seq)?;
        self.after_write();
        Ok(value)
    }

    fn after_write(&mut self) {
        self.writes_since_validation += 1;
        if self.validation_interval == 0 || self.writes_since_validation < self.validation_interval
        {
            return;
        }
        if let Err(err) = self.validate_state_consistency() {
            self.writes_since_validation = 0;
            tracing::warn!(error = %format!("{err:#}"), "automatic consistency validation failed");
        }
    }
}

fn diverge(
    entity: EntityKind,
    in_log: &BTreeSet<String>,
    in_legacy: &BTreeSet<String>,
) -> Option<Divergence> {
    let missing_in_event_log: Vec<String> = in_legacy.difference(in_log).cloned().collect();
    let missing_in_legacy: Vec<String> = in_log.difference(in_legacy).cloned().collect();
    if missing_in_event_log.is_empty() && missing_in_legacy.is_empty() {
        return None;
    }
    Some(Divergence {
        entity,
        missing_in_event_log,
        missing_in_legacy,
    })
}
