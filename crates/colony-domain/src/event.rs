//! Typed coordination events and their on-disk record envelope.
//!
//! Each line of an event log is an [`EventRecord`]: `{seq, type, payload,
//! checksum, timestamp}`. The checksum covers `(seq, type, payload)` only.
//! Decoding a record is where corruption is detected; the projector itself
//! only ever sees well-formed [`Event`] values.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::AgentStatus;
use crate::{format_rfc3339, hash_bytes, ColonyError, DateTimeUtc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventType {
    #[serde(rename = "agent.registered")]
    AgentRegistered,
    #[serde(rename = "agent.status_updated")]
    AgentStatusUpdated,
    #[serde(rename = "agent.cursor_updated")]
    AgentCursorUpdated,
    #[serde(rename = "finding.added")]
    FindingAdded,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "task.added")]
    TaskAdded,
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "question.asked")]
    QuestionAsked,
    #[serde(rename = "question.answered")]
    QuestionAnswered,
    #[serde(rename = "context.set")]
    ContextSet,
    #[serde(rename = "system.reset")]
    SystemReset,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentRegistered => "agent.registered",
            Self::AgentStatusUpdated => "agent.status_updated",
            Self::AgentCursorUpdated => "agent.cursor_updated",
            Self::FindingAdded => "finding.added",
            Self::MessageSent => "message.sent",
            Self::MessageRead => "message.read",
            Self::TaskAdded => "task.added",
            Self::TaskClaimed => "task.claimed",
            Self::TaskCompleted => "task.completed",
            Self::QuestionAsked => "question.asked",
            Self::QuestionAnswered => "question.answered",
            Self::ContextSet => "context.set",
            Self::SystemReset => "system.reset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent.registered" => Some(Self::AgentRegistered),
            "agent.status_updated" => Some(Self::AgentStatusUpdated),
            "agent.cursor_updated" => Some(Self::AgentCursorUpdated),
            "finding.added" => Some(Self::FindingAdded),
            "message.sent" => Some(Self::MessageSent),
            "message.read" => Some(Self::MessageRead),
            "task.added" => Some(Self::TaskAdded),
            "task.claimed" => Some(Self::TaskClaimed),
            "task.completed" => Some(Self::TaskCompleted),
            "question.asked" => Some(Self::QuestionAsked),
            "question.answered" => Some(Self::QuestionAnswered),
            "context.set" => Some(Self::ContextSet),
            "system.reset" => Some(Self::SystemReset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentRegistered {
    pub agent_id: String,
    pub task: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentStatusUpdated {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentCursorUpdated {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FindingAdded {
    pub agent_id: String,
    pub finding_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: u8,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageSent {
    pub from_agent: String,
    #[serde(default)]
    pub to_agent: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageRead {
    pub message_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskAdded {
    pub description: String,
    pub created_by: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskClaimed {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskCompleted {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionAsked {
    pub agent_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionAnswered {
    pub question_id: String,
    pub answer: String,
    pub answered_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSet {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SystemReset {
    #[serde(default)]
    pub reason: Option<String>,
}

/// One fact in the coordination history. The wire tag is the dotted event type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "agent.registered")]
    AgentRegistered(AgentRegistered),
    #[serde(rename = "agent.status_updated")]
    AgentStatusUpdated(AgentStatusUpdated),
    #[serde(rename = "agent.cursor_updated")]
    AgentCursorUpdated(AgentCursorUpdated),
    #[serde(rename = "finding.added")]
    FindingAdded(FindingAdded),
    #[serde(rename = "message.sent")]
    MessageSent(MessageSent),
    #[serde(rename = "message.read")]
    MessageRead(MessageRead),
    #[serde(rename = "task.added")]
    TaskAdded(TaskAdded),
    #[serde(rename = "task.claimed")]
    TaskClaimed(TaskClaimed),
    #[serde(rename = "task.completed")]
    TaskCompleted(TaskCompleted),
    #[serde(rename = "question.asked")]
    QuestionAsked(QuestionAsked),
    #[serde(rename = "question.answered")]
    QuestionAnswered(QuestionAnswered),
    #[serde(rename = "context.set")]
    ContextSet(ContextSet),
    #[serde(rename = "system.reset")]
    SystemReset(SystemReset),
}

impl Event {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AgentRegistered(_) => EventType::AgentRegistered,
            Self::AgentStatusUpdated(_) => EventType::AgentStatusUpdated,
            Self::AgentCursorUpdated(_) => EventType::AgentCursorUpdated,
            Self::FindingAdded(_) => EventType::FindingAdded,
            Self::MessageSent(_) => EventType::MessageSent,
            Self::MessageRead(_) => EventType::MessageRead,
            Self::TaskAdded(_) => EventType::TaskAdded,
            Self::TaskClaimed(_) => EventType::TaskClaimed,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::QuestionAsked(_) => EventType::QuestionAsked,
            Self::QuestionAnswered(_) => EventType::QuestionAnswered,
            Self::ContextSet(_) => EventType::ContextSet,
            Self::SystemReset(_) => EventType::SystemReset,
        }
    }

    /// Payload object as written to the `payload` field of a record.
    ///
    /// # Errors
    /// Returns [`ColonyError::Validation`] if the payload cannot be serialized.
    pub fn payload_json(&self) -> Result<Value, ColonyError> {
        let mut tagged = serde_json::to_value(self).map_err(|err| {
            ColonyError::Validation(format!("failed to serialize event payload: {err}"))
        })?;
        Ok(tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| json!({})))
    }

    /// Rebuild a typed event from its tag and raw payload.
    ///
    /// # Errors
    /// Returns [`ColonyError::Corruption`] when the payload does not have the
    /// shape required by `event_type`.
    pub fn from_parts(event_type: EventType, payload: Value) -> Result<Self, ColonyError> {
        serde_json::from_value(json!({"type": event_type.as_str(), "payload": payload})).map_err(
            |err| {
                ColonyError::Corruption(format!(
                    "payload does not match {}: {err}",
                    event_type.as_str()
                ))
            },
        )
    }
}

/// Checksum over the canonical `[seq, type, payload]` triple.
///
/// # Errors
/// Returns [`ColonyError::Validation`] if the triple cannot be serialized.
pub fn compute_checksum(seq: u64, event_type: &str, payload: &Value) -> Result<String, ColonyError> {
    let material = serde_json::to_vec(&json!([seq, event_type, payload])).map_err(|err| {
        ColonyError::Validation(format!("failed to serialize checksum material: {err}"))
    })?;
    Ok(hash_bytes(&material))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub checksum: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub timestamp: String,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Known(SequencedEvent),
    /// Checksum verified but the type tag is not one this build understands.
    Unknown { seq: u64, event_type: String },
}

impl EventRecord {
    /// Build the sealed record for `event` at position `seq`.
    ///
    /// # Errors
    /// Returns [`ColonyError::Validation`] if serialization fails.
    pub fn seal(seq: u64, event: &Event, recorded_at: DateTimeUtc) -> Result<Self, ColonyError> {
        let event_type = event.event_type().as_str().to_string();
        let payload = event.payload_json()?;
        let checksum = compute_checksum(seq, &event_type, &payload)?;
        Ok(Self {
            seq,
            event_type,
            payload,
            checksum,
            timestamp: format_rfc3339(recorded_at)?,
        })
    }

    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        compute_checksum(self.seq, &self.event_type, &self.payload)
            .is_ok_and(|expected| expected == self.checksum)
    }

    /// # Errors
    /// Returns [`ColonyError::Corruption`] on checksum mismatch or when a known
    /// event type carries a malformed payload.
    pub fn decode(&self) -> Result<DecodedRecord, ColonyError> {
        if !self.verify_checksum() {
            return Err(ColonyError::Corruption(format!(
                "checksum mismatch for seq {}",
                self.seq
            )));
        }

        let Some(event_type) = EventType::parse(&self.event_type) else {
            return Ok(DecodedRecord::Unknown {
                seq: self.seq,
                event_type: self.event_type.clone(),
            });
        };

        let event = Event::from_parts(event_type, self.payload.clone())?;
        Ok(DecodedRecord::Known(SequencedEvent {
            seq: self.seq,
            timestamp: self.timestamp.clone(),
            event,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{DecodedRecord, Event, EventRecord, EventType, FindingAdded, SystemReset};
    use crate::now_utc;
    use serde_json::json;

    fn finding() -> Event {
        Event::FindingAdded(FindingAdded {
            agent_id: "agent-1".to_string(),
            finding_type: "bug".to_string(),
            tags: vec!["auth".to_string()],
            importance: 7,
            content: "token not rotated".to_string(),
        })
    }

    #[test]
    fn sealed_record_uses_dotted_type_and_bare_payload() {
        let record = EventRecord::seal(3, &finding(), now_utc()).unwrap_or_else(|_| unreachable!());
        assert_eq!(record.event_type, "finding.added");
        assert_eq!(record.payload["importance"], json!(7));
        assert!(record.payload.get("type").is_none());
        assert!(record.verify_checksum());
    }

    #[test]
    fn tampered_payload_fails_decode() {
        let mut record =
            EventRecord::seal(1, &finding(), now_utc()).unwrap_or_else(|_| unreachable!());
        record.payload["content"] = json!("edited after the fact");
        assert!(record.decode().is_err());
    }

    #[test]
    fn unknown_types_decode_as_unknown_when_checksum_holds() {
        let payload = json!({"anything": true});
        let checksum = super::compute_checksum(9, "swarm.migrated", &payload)
            .unwrap_or_else(|_| unreachable!());
        let record = EventRecord {
            seq: 9,
            event_type: "swarm.migrated".to_string(),
            payload,
            checksum,
            timestamp: "2026-02-07T12:00:00Z".to_string(),
        };
        assert_eq!(
            record.decode(),
            Ok(DecodedRecord::Unknown {
                seq: 9,
                event_type: "swarm.migrated".to_string()
            })
        );
    }

    #[test]
    fn known_type_with_wrong_shape_is_corruption() {
        let payload = json!({"agent_id": 42});
        let checksum = super::compute_checksum(2, "agent.registered", &payload)
            .unwrap_or_else(|_| unreachable!());
        let record = EventRecord {
            seq: 2,
            event_type: "agent.registered".to_string(),
            payload,
            checksum,
            timestamp: "2026-02-07T12:00:00Z".to_string(),
        };
        assert!(record.decode().is_err());
    }

    #[test]
    fn reset_round_trips_with_empty_payload() {
        let event = Event::from_parts(EventType::SystemReset, json!({}));
        assert_eq!(event, Ok(Event::SystemReset(SystemReset::default())));
    }
}
