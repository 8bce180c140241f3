use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use colony_domain::{
    finding_id, message_id, now_utc, question_id, task_id, AgentRegistered, AgentState,
    AgentStatus, AgentStatusUpdated, AggregateState, ColonyConfig, ColonyError, Finding,
    FindingAdded, Message, MessageRead, MessageSent, Question, QuestionAnswered, QuestionAsked,
    QuestionStatus, Task, TaskAdded, TaskClaimed, TaskCompleted, TaskStatus,
};
use colony_store_core::LegacyStore;
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use serde_json::Value;

use crate::{
    apply_schema, bool_to_sql, open_connection, rfc3339, u64_from_sql, u64_to_sql,
    DEFAULT_BUSY_TIMEOUT_MS,
};

const LEGACY_SCHEMA_VERSION: i64 = 1;

const LEGACY_SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS legacy_agents (
  agent_id TEXT PRIMARY KEY,
  task TEXT NOT NULL,
  scope_json TEXT NOT NULL,
  interests_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','working','blocked','completed','failed')),
  cursor INTEGER NOT NULL DEFAULT 0,
  result TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_findings (
  finding_id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL UNIQUE,
  agent_id TEXT NOT NULL,
  finding_type TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  importance INTEGER NOT NULL CHECK (importance BETWEEN 1 AND 10),
  content TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_messages (
  message_id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL UNIQUE,
  from_agent TEXT NOT NULL,
  to_agent TEXT,
  content TEXT NOT NULL,
  read_by_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_tasks (
  task_id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL UNIQUE,
  description TEXT NOT NULL,
  created_by TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL CHECK (status IN ('pending','claimed','completed')),
  claimed_by TEXT,
  result TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_questions (
  question_id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL UNIQUE,
  agent_id TEXT NOT NULL,
  question TEXT NOT NULL,
  options_json TEXT NOT NULL,
  blocking INTEGER NOT NULL CHECK (blocking IN (0,1)),
  status TEXT NOT NULL CHECK (status IN ('open','resolved')),
  answer TEXT,
  answered_by TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS legacy_context (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Mutable coordination tables. Rows are updated in place and carry no history.
pub struct SqliteLegacyStore {
    conn: Connection,
}

impl SqliteLegacyStore {
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path, DEFAULT_BUSY_TIMEOUT_MS)?,
        })
    }

    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn from_config(config: &ColonyConfig) -> Result<Self> {
        Ok(Self {
            conn: open_connection(&config.database_path, config.busy_timeout_ms)?,
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn agent(&self, agent_id: &str) -> Result<AgentState> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, task, scope_json, interests_json, status, cursor, result
             FROM legacy_agents WHERE agent_id = ?1",
        )?;
        let mut rows = stmt.query(params![agent_id])?;
        match rows.next()? {
            Some(row) => agent_from_row(row),
            None => Err(ColonyError::NotFound(format!("agent {agent_id}")).into()),
        }
    }

    fn message(&self, id: &str) -> Result<Message> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, seq, from_agent, to_agent, content, read_by_json
             FROM legacy_messages WHERE message_id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => message_from_row(row),
            None => Err(ColonyError::NotFound(format!("message {id}")).into()),
        }
    }

    fn task(&self, id: &str) -> Result<Task> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, seq, description, created_by, priority, status, claimed_by, result
             FROM legacy_tasks WHERE task_id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => task_from_row(row),
            None => Err(ColonyError::NotFound(format!("task {id}")).into()),
        }
    }

    fn question(&self, id: &str) -> Result<Question> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, seq, agent_id, question, options_json, blocking, status,
                    answer, answered_by
             FROM legacy_questions WHERE question_id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => question_from_row(row),
            None => Err(ColonyError::NotFound(format!("question {id}")).into()),
        }
    }

    /// Take the write lock before the first read so competing connections
    /// queue on `busy_timeout` instead of deciding from a stale row.
    fn write_transaction(&self, what: &str) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {what} transaction"))
    }

    fn transition_task(&self, id: &str, next: TaskStatus) -> Result<Task> {
        let task = self.task(id)?;
        if !task.status.can_transition_to(next) {
            return Err(ColonyError::InvalidTransition(format!(
                "task {id} cannot move from {} to {}",
                task.status.as_str(),
                next.as_str()
            ))
            .into());
        }
        Ok(task)
    }
}

impl LegacyStore for SqliteLegacyStore {
    fn migrate(&self) -> Result<()> {
        apply_schema(&self.conn, "legacy", LEGACY_SCHEMA_VERSION, LEGACY_SCHEMA_V1)
    }

    fn register_agent(&self, input: &AgentRegistered) -> Result<AgentState> {
        self.conn
            .execute(
                "INSERT INTO legacy_agents(
                    agent_id, task, scope_json, interests_json, status, cursor, result, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, 'active', 0, NULL, ?5)
                 ON CONFLICT(agent_id) DO UPDATE SET
                    task = excluded.task,
                    scope_json = excluded.scope_json,
                    interests_json = excluded.interests_json,
                    status = 'active',
                    cursor = 0,
                    result = NULL,
                    updated_at = excluded.updated_at",
                params![
                    input.agent_id,
                    input.task,
                    serde_json::to_string(&input.scope)?,
                    serde_json::to_string(&input.interests)?,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to register legacy agent")?;
        self.agent(&input.agent_id)
    }

    fn update_agent_status(&self, input: &AgentStatusUpdated) -> Result<AgentState> {
        let tx = self.write_transaction("agent status")?;
        let agent = self.agent(&input.agent_id)?;
        if !agent.status.can_transition_to(input.status) {
            return Err(ColonyError::InvalidTransition(format!(
                "agent {} cannot move from {} to {}",
                input.agent_id,
                agent.status.as_str(),
                input.status.as_str()
            ))
            .into());
        }
        tx.execute(
            "UPDATE legacy_agents SET
                status = ?2,
                result = COALESCE(?3, result),
                updated_at = ?4
             WHERE agent_id = ?1",
            params![
                input.agent_id,
                input.status.as_str(),
                input.result,
                rfc3339(now_utc())?,
            ],
        )
        .context("failed to update legacy agent status")?;
        tx.commit().context("failed to commit agent status")?;
        self.agent(&input.agent_id)
    }

    fn update_cursor(&self, agent_id: &str, cursor: u64) -> Result<AgentState> {
        let changed = self
            .conn
            .execute(
                "UPDATE legacy_agents SET cursor = ?2, updated_at = ?3 WHERE agent_id = ?1",
                params![agent_id, u64_to_sql(cursor, "cursor")?, rfc3339(now_utc())?],
            )
            .context("failed to update legacy agent cursor")?;
        if changed == 0 {
            return Err(ColonyError::NotFound(format!("agent {agent_id}")).into());
        }
        self.agent(agent_id)
    }

    fn add_finding(&self, seq: u64, input: &FindingAdded) -> Result<Finding> {
        let finding = Finding {
            id: finding_id(seq),
            seq,
            agent_id: input.agent_id.clone(),
            finding_type: input.finding_type.clone(),
            tags: input.tags.clone(),
            importance: input.importance,
            content: input.content.clone(),
        };
        self.conn
            .execute(
                "INSERT INTO legacy_findings(
                    finding_id, seq, agent_id, finding_type, tags_json, importance, content, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    finding.id,
                    u64_to_sql(seq, "seq")?,
                    finding.agent_id,
                    finding.finding_type,
                    serde_json::to_string(&finding.tags)?,
                    i64::from(finding.importance),
                    finding.content,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert legacy finding")?;
        Ok(finding)
    }

    fn send_message(&self, seq: u64, input: &MessageSent) -> Result<Message> {
        let message = Message {
            id: message_id(seq),
            seq,
            from_agent: input.from_agent.clone(),
            to_agent: input.to_agent.clone(),
            content: input.content.clone(),
            read_by: BTreeSet::new(),
        };
        self.conn
            .execute(
                "INSERT INTO legacy_messages(
                    message_id, seq, from_agent, to_agent, content, read_by_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6)",
                params![
                    message.id,
                    u64_to_sql(seq, "seq")?,
                    message.from_agent,
                    message.to_agent,
                    message.content,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert legacy message")?;
        Ok(message)
    }

    fn mark_message_read(&self, input: &MessageRead) -> Result<Message> {
        let tx = self.write_transaction("message read")?;
        let mut message = self.message(&input.message_id)?;
        message.read_by.insert(input.agent_id.clone());
        tx.execute(
            "UPDATE legacy_messages SET read_by_json = ?2 WHERE message_id = ?1",
            params![message.id, serde_json::to_string(&message.read_by)?],
        )
        .context("failed to mark legacy message read")?;
        tx.commit().context("failed to commit message read")?;
        Ok(message)
    }

    fn add_task(&self, seq: u64, input: &TaskAdded) -> Result<Task> {
        let task = Task {
            id: task_id(seq),
            seq,
            description: input.description.clone(),
            created_by: input.created_by.clone(),
            priority: input.priority,
            status: TaskStatus::Pending,
            claimed_by: None,
            result: None,
        };
        self.conn
            .execute(
                "INSERT INTO legacy_tasks(
                    task_id, seq, description, created_by, priority, status, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    task.id,
                    u64_to_sql(seq, "seq")?,
                    task.description,
                    task.created_by,
                    task.priority,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert legacy task")?;
        Ok(task)
    }

    fn claim_task(&self, input: &TaskClaimed) -> Result<Task> {
        let tx = self.write_transaction("task claim")?;
        let mut task = self.transition_task(&input.task_id, TaskStatus::Claimed)?;
        let changed = tx
            .execute(
                "UPDATE legacy_tasks SET status = 'claimed', claimed_by = ?2, updated_at = ?3
                 WHERE task_id = ?1 AND status = 'pending'",
                params![task.id, input.agent_id, rfc3339(now_utc())?],
            )
            .context("failed to claim legacy task")?;
        if changed == 0 {
            return Err(ColonyError::InvalidTransition(format!(
                "task {} was claimed concurrently",
                task.id
            ))
            .into());
        }
        tx.commit().context("failed to commit task claim")?;
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(input.agent_id.clone());
        Ok(task)
    }

    fn complete_task(&self, input: &TaskCompleted) -> Result<Task> {
        let tx = self.write_transaction("task completion")?;
        let mut task = self.transition_task(&input.task_id, TaskStatus::Completed)?;
        let changed = tx
            .execute(
                "UPDATE legacy_tasks SET status = 'completed', result = ?2, updated_at = ?3
                 WHERE task_id = ?1 AND status = 'claimed'",
                params![task.id, input.result, rfc3339(now_utc())?],
            )
            .context("failed to complete legacy task")?;
        if changed == 0 {
            return Err(ColonyError::InvalidTransition(format!(
                "task {} was completed concurrently",
                task.id
            ))
            .into());
        }
        tx.commit().context("failed to commit task completion")?;
        task.status = TaskStatus::Completed;
        task.result.clone_from(&input.result);
        Ok(task)
    }

    fn ask_question(&self, seq: u64, input: &QuestionAsked) -> Result<Question> {
        let question = Question {
            id: question_id(seq),
            seq,
            agent_id: input.agent_id.clone(),
            question: input.question.clone(),
            options: input.options.clone(),
            blocking: input.blocking,
            status: QuestionStatus::Open,
            answer: None,
            answered_by: None,
        };
        self.conn
            .execute(
                "INSERT INTO legacy_questions(
                    question_id, seq, agent_id, question, options_json, blocking, status, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
                params![
                    question.id,
                    u64_to_sql(seq, "seq")?,
                    question.agent_id,
                    question.question,
                    serde_json::to_string(&question.options)?,
                    bool_to_sql(question.blocking),
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to insert legacy question")?;
        Ok(question)
    }

    fn answer_question(&self, input: &QuestionAnswered) -> Result<Question> {
        let tx = self.write_transaction("question answer")?;
        let mut question = self.question(&input.question_id)?;
        if !question.status.can_transition_to(QuestionStatus::Resolved) {
            return Err(ColonyError::InvalidTransition(format!(
                "question {} is already {}",
                question.id,
                question.status.as_str()
            ))
            .into());
        }
        tx.execute(
            "UPDATE legacy_questions SET
                status = 'resolved', answer = ?2, answered_by = ?3, updated_at = ?4
             WHERE question_id = ?1 AND status = 'open'",
            params![
                question.id,
                input.answer,
                input.answered_by,
                rfc3339(now_utc())?
            ],
        )
        .context("failed to answer legacy question")?;
        tx.commit().context("failed to commit question answer")?;
        question.status = QuestionStatus::Resolved;
        question.answer = Some(input.answer.clone());
        question.answered_by = Some(input.answered_by.clone());
        Ok(question)
    }

    fn set_context(&self, key: &str, value: &Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO legacy_context(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value_json = excluded.value_json,
                    updated_at = excluded.updated_at",
                params![key, serde_json::to_string(value)?, rfc3339(now_utc())?],
            )
            .context("failed to set legacy context")?;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "BEGIN;
                 DELETE FROM legacy_agents;
                 DELETE FROM legacy_findings;
                 DELETE FROM legacy_messages;
                 DELETE FROM legacy_tasks;
                 DELETE FROM legacy_questions;
                 DELETE FROM legacy_context;
                 COMMIT;",
            )
            .context("failed to reset legacy store")?;
        Ok(())
    }

    fn load_state(&self) -> Result<AggregateState> {
        let mut state = AggregateState::default();

        let mut stmt = self.conn.prepare(
            "SELECT agent_id, task, scope_json, interests_json, status, cursor, result
             FROM legacy_agents ORDER BY agent_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let agent = agent_from_row(row)?;
            state.agents.insert(agent.agent_id.clone(), agent);
        }

        let mut stmt = self.conn.prepare(
            "SELECT finding_id, seq, agent_id, finding_type, tags_json, importance, content
             FROM legacy_findings ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            state.findings.push(finding_from_row(row)?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT message_id, seq, from_agent, to_agent, content, read_by_json
             FROM legacy_messages ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            state.messages.push(message_from_row(row)?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT task_id, seq, description, created_by, priority, status, claimed_by, result
             FROM legacy_tasks ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            state.tasks.push(task_from_row(row)?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT question_id, seq, agent_id, question, options_json, blocking, status,
                    answer, answered_by
             FROM legacy_questions ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            state.questions.push(question_from_row(row)?);
        }

        let mut context = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT key, value_json FROM legacy_context ORDER BY key ASC")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value_json: String = row.get(1)?;
            let value: Value =
                serde_json::from_str(&value_json).context("invalid legacy_context.value_json")?;
            context.insert(key, value);
        }
        state.context = context;

        state.last_seq = state
            .findings
            .iter()
            .map(|item| item.seq)
            .chain(state.messages.iter().map(|item| item.seq))
            .chain(state.tasks.iter().map(|item| item.seq))
            .chain(state.questions.iter().map(|item| item.seq))
            .max()
            .unwrap_or(0);

        Ok(state)
    }
}

fn agent_from_row(row: &Row<'_>) -> Result<AgentState> {
    let scope_json: String = row.get(2)?;
    let interests_json: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(AgentState {
        agent_id: row.get(0)?,
        task: row.get(1)?,
        scope: serde_json::from_str(&scope_json).context("invalid legacy_agents.scope_json")?,
        interests: serde_json::from_str(&interests_json)
            .context("invalid legacy_agents.interests_json")?,
        status: AgentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown agent status: {status}"))?,
        cursor: u64_from_sql(row.get(5)?, "cursor")?,
        result: row.get(6)?,
    })
}

fn finding_from_row(row: &Row<'_>) -> Result<Finding> {
    let tags_json: String = row.get(4)?;
    let importance: i64 = row.get(5)?;
    Ok(Finding {
        id: row.get(0)?,
        seq: u64_from_sql(row.get(1)?, "seq")?,
        agent_id: row.get(2)?,
        finding_type: row.get(3)?,
        tags: serde_json::from_str(&tags_json).context("invalid legacy_findings.tags_json")?,
        importance: u8::try_from(importance)
            .map_err(|_| anyhow!("invalid importance: {importance}"))?,
        content: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<Message> {
    let read_by_json: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        seq: u64_from_sql(row.get(1)?, "seq")?,
        from_agent: row.get(2)?,
        to_agent: row.get(3)?,
        content: row.get(4)?,
        read_by: serde_json::from_str(&read_by_json)
            .context("invalid legacy_messages.read_by_json")?,
    })
}

fn task_from_row(row: &Row<'_>) -> Result<Task> {
    let status: String = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        seq: u64_from_sql(row.get(1)?, "seq")?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        priority: row.get(4)?,
        status: TaskStatus::parse(&status).ok_or_else(|| anyhow!("unknown task status: {status}"))?,
        claimed_by: row.get(6)?,
        result: row.get(7)?,
    })
}

fn question_from_row(row: &Row<'_>) -> Result<Question> {
    let options_json: String = row.get(4)?;
    let blocking: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Question {
        id: row.get(0)?,
        seq: u64_from_sql(row.get(1)?, "seq")?,
        agent_id: row.get(2)?,
        question: row.get(3)?,
        options: serde_json::from_str(&options_json)
            .context("invalid legacy_questions.options_json")?,
        blocking: blocking != 0,
        status: QuestionStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown question status: {status}"))?,
        answer: row.get(7)?,
        answered_by: row.get(8)?,
    })
}
