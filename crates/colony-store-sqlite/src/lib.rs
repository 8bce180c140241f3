#![forbid(unsafe_code)]

mod conductor;
mod legacy;
mod trails;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use colony_domain::{format_rfc3339, now_utc, parse_rfc3339, ColonyConfig, DateTimeUtc};
use rusqlite::{params, Connection};

pub use legacy::SqliteLegacyStore;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const COLONY_SCHEMA_VERSION: i64 = 1;

const MIGRATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  component TEXT NOT NULL,
  version INTEGER NOT NULL,
  applied_at TEXT NOT NULL,
  PRIMARY KEY (component, version)
);
";

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL,
  nodes_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_edges (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_id TEXT NOT NULL,
  from_node TEXT NOT NULL,
  to_node TEXT NOT NULL,
  UNIQUE(workflow_id, from_node, to_node),
  FOREIGN KEY (workflow_id) REFERENCES workflows(workflow_id)
);

CREATE TABLE IF NOT EXISTS workflow_runs (
  run_id TEXT PRIMARY KEY,
  workflow_name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  phase TEXT,
  total_nodes INTEGER NOT NULL DEFAULT 0,
  completed_nodes INTEGER NOT NULL DEFAULT 0,
  failed_nodes INTEGER NOT NULL DEFAULT 0,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  ended_at TEXT,
  input_json TEXT NOT NULL,
  output_json TEXT,
  context_json TEXT NOT NULL,
  FOREIGN KEY (workflow_name) REFERENCES workflows(name)
);

CREATE TABLE IF NOT EXISTS node_executions (
  exec_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  node_id TEXT NOT NULL,
  node_name TEXT NOT NULL,
  node_type TEXT NOT NULL CHECK (node_type IN ('single','swarm','parallel')),
  agent_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  prompt TEXT NOT NULL,
  result_text TEXT,
  result_json TEXT,
  findings_json TEXT NOT NULL DEFAULT '[]',
  files_modified_json TEXT NOT NULL DEFAULT '[]',
  error_message TEXT,
  error_type TEXT,
  duration_ms INTEGER,
  created_at TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  FOREIGN KEY (run_id) REFERENCES workflow_runs(run_id)
);

CREATE TABLE IF NOT EXISTS trails (
  trail_id TEXT PRIMARY KEY,
  run_id TEXT,
  location TEXT NOT NULL,
  location_type TEXT NOT NULL,
  scent TEXT NOT NULL CHECK (scent IN ('discovery','warning','blocker','hot','cold','success')),
  strength REAL NOT NULL CHECK (strength >= 0.0 AND strength <= 1.0),
  agent_id TEXT NOT NULL,
  message TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT
);

CREATE TABLE IF NOT EXISTS conductor_decisions (
  decision_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  node_id TEXT,
  decision_type TEXT NOT NULL CHECK (decision_type IN ('route','skip_node','finish_run','resubmit')),
  reason TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES workflow_runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_workflow_edges_workflow ON workflow_edges(workflow_id, id);
CREATE INDEX IF NOT EXISTS idx_node_executions_run ON node_executions(run_id);
CREATE INDEX IF NOT EXISTS idx_trails_location ON trails(location);
CREATE INDEX IF NOT EXISTS idx_trails_run ON trails(run_id);
CREATE INDEX IF NOT EXISTS idx_conductor_decisions_run ON conductor_decisions(run_id);

CREATE TRIGGER IF NOT EXISTS trg_workflows_no_update
BEFORE UPDATE ON workflows
BEGIN
  SELECT RAISE(FAIL, 'workflows are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_workflow_edges_no_update
BEFORE UPDATE ON workflow_edges
BEGIN
  SELECT RAISE(FAIL, 'workflow_edges are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_node_executions_terminal_immutable
BEFORE UPDATE ON node_executions
WHEN OLD.status IN ('completed','failed')
BEGIN
  SELECT RAISE(FAIL, 'node_executions row is immutable after terminal status');
END;
CREATE TRIGGER IF NOT EXISTS trg_node_executions_no_delete
BEFORE DELETE ON node_executions
BEGIN
  SELECT RAISE(FAIL, 'node_executions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_trails_decay_only
BEFORE UPDATE ON trails
WHEN NEW.strength > OLD.strength
  OR NEW.trail_id IS NOT OLD.trail_id
  OR NEW.run_id IS NOT OLD.run_id
  OR NEW.location IS NOT OLD.location
  OR NEW.scent IS NOT OLD.scent
  OR NEW.agent_id IS NOT OLD.agent_id
  OR NEW.message IS NOT OLD.message
  OR NEW.created_at IS NOT OLD.created_at
BEGIN
  SELECT RAISE(FAIL, 'trails only change through strength decay');
END;

CREATE TRIGGER IF NOT EXISTS trg_conductor_decisions_no_update
BEFORE UPDATE ON conductor_decisions
BEGIN
  SELECT RAISE(FAIL, 'conductor_decisions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_conductor_decisions_no_delete
BEFORE DELETE ON conductor_decisions
BEGIN
  SELECT RAISE(FAIL, 'conductor_decisions is append-only');
END;
";

/// Workflow, run, execution, trail and decision tables in one `SQLite` file.
pub struct SqliteColonyStore {
    conn: Connection,
}

impl SqliteColonyStore {
    /// Open or create the database with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path, busy_timeout_ms)?,
        })
    }

    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn from_config(config: &ColonyConfig) -> Result<Self> {
        Self::open_with_busy_timeout(&config.database_path, config.busy_timeout_ms)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

pub(crate) fn apply_schema(
    conn: &Connection,
    component: &str,
    version: i64,
    schema: &str,
) -> Result<()> {
    conn.execute_batch(MIGRATIONS_TABLE)
        .context("failed to create schema_migrations")?;
    conn.execute_batch(schema)
        .with_context(|| format!("failed to apply {component} schema"))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(component, version, applied_at) VALUES (?1, ?2, ?3)",
        params![component, version, rfc3339(now_utc())?],
    )
    .with_context(|| format!("failed to record {component} migration"))?;
    Ok(())
}

pub(crate) fn rfc3339(value: DateTimeUtc) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

pub(crate) fn parse_time(value: &str) -> Result<DateTimeUtc> {
    Ok(parse_rfc3339(value)?)
}

pub(crate) fn parse_optional_time(value: Option<String>) -> Result<Option<DateTimeUtc>> {
    value.as_deref().map(parse_time).transpose()
}

pub(crate) fn u64_to_sql(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{field} too large for sqlite: {value}"))
}

pub(crate) fn u64_from_sql(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("invalid {field}: {value}"))
}

pub(crate) fn u32_from_sql(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("invalid {field}: {value}"))
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn ensure_schema_applied(conn: &Connection) -> Result<()> {
    apply_schema(conn, "colony", COLONY_SCHEMA_VERSION, SCHEMA_V1)
}
