use anyhow::{anyhow, Context, Result};
use colony_domain::{
    now_utc, ColonyError, ConductorDecision, DecisionId, DecisionType, NodeExecution,
    NodeExecutionId, NodeExecutionStatus, NodeType, RunId, RunStatus, WorkflowDefinition,
    WorkflowEdge, WorkflowId, WorkflowNode, WorkflowRun,
};
use colony_store_core::{ConductorStore, NodeCompletion, NodeFailure};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::{
    ensure_schema_applied, parse_optional_time, parse_time, rfc3339, u32_from_sql, u64_from_sql,
    u64_to_sql, SqliteColonyStore,
};

const RUN_COLUMNS: &str = "run_id, workflow_name, status, phase, total_nodes, completed_nodes,
    failed_nodes, started_at, updated_at, ended_at, input_json, output_json, context_json";

const EXECUTION_COLUMNS: &str = "exec_id, run_id, node_id, node_name, node_type, agent_id,
    status, prompt, result_text, result_json, findings_json, files_modified_json,
    error_message, error_type, duration_ms, created_at, started_at, ended_at";

impl ConductorStore for SqliteColonyStore {
    fn migrate(&self) -> Result<()> {
        ensure_schema_applied(&self.conn)
    }

    fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let exists: Option<String> = self
            .conn
            .query_row(
                "SELECT workflow_id FROM workflows WHERE name = ?1",
                params![workflow.name],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check workflow name")?;
        if exists.is_some() {
            return Err(ColonyError::Conflict(format!(
                "workflow {} already exists",
                workflow.name
            ))
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start workflow transaction")?;
        tx.execute(
            "INSERT INTO workflows(workflow_id, name, description, nodes_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workflow.workflow_id.to_string(),
                workflow.name,
                workflow.description,
                serde_json::to_string(&workflow.nodes)?,
                rfc3339(workflow.created_at)?,
            ],
        )
        .context("failed to insert workflow")?;

        for edge in &workflow.edges {
            tx.execute(
                "INSERT INTO workflow_edges(workflow_id, from_node, to_node) VALUES (?1, ?2, ?3)",
                params![workflow.workflow_id.to_string(), edge.from, edge.to],
            )
            .context("failed to insert workflow edge")?;
        }

        tx.commit().context("failed to commit workflow transaction")?;
        Ok(())
    }

    fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let row = self
            .conn
            .query_row(
                "SELECT workflow_id, name, description, nodes_json, created_at
                 FROM workflows WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to load workflow")?;

        row.map(|(workflow_id, name, description, nodes_json, created_at)| {
            workflow_from_parts(
                &self.conn,
                &workflow_id,
                name,
                description,
                &nodes_json,
                &created_at,
            )
        })
        .transpose()
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, name, description, nodes_json, created_at
             FROM workflows ORDER BY name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let workflow_id: String = row.get(0)?;
            let nodes_json: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            out.push(workflow_from_parts(
                &self.conn,
                &workflow_id,
                row.get(1)?,
                row.get(2)?,
                &nodes_json,
                &created_at,
            )?);
        }
        Ok(out)
    }

    fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_runs(
                    run_id, workflow_name, status, phase, total_nodes, completed_nodes,
                    failed_nodes, started_at, updated_at, ended_at, input_json, output_json,
                    context_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.run_id.to_string(),
                    run.workflow_name,
                    run.status.as_str(),
                    run.phase,
                    i64::from(run.total_nodes),
                    i64::from(run.completed_nodes),
                    i64::from(run.failed_nodes),
                    rfc3339(run.started_at)?,
                    rfc3339(run.updated_at)?,
                    run.ended_at.map(rfc3339).transpose()?,
                    serde_json::to_string(&run.input)?,
                    run.output.as_ref().map(serde_json::to_string).transpose()?,
                    serde_json::to_string(&run.context)?,
                ],
            )
            .context("failed to insert workflow run")?;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE run_id = ?1"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs ORDER BY rowid ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<&Value>,
    ) -> Result<()> {
        let current = current_run_status(&self.conn, run_id)?;
        if !current.can_transition_to(status) {
            return Err(ColonyError::InvalidTransition(format!(
                "run {run_id} cannot move from {} to {}",
                current.as_str(),
                status.as_str()
            ))
            .into());
        }

        let now = rfc3339(now_utc())?;
        let ended_at = status.is_terminal().then(|| now.clone());
        self.conn
            .execute(
                "UPDATE workflow_runs SET
                    status = ?2,
                    updated_at = ?3,
                    ended_at = ?4,
                    output_json = COALESCE(?5, output_json)
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    now,
                    ended_at,
                    output.map(serde_json::to_string).transpose()?,
                ],
            )
            .context("failed to update run status")?;
        Ok(())
    }

    fn update_run_phase(&self, run_id: RunId, phase: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_runs SET phase = ?2, updated_at = ?3 WHERE run_id = ?1",
                params![run_id.to_string(), phase, rfc3339(now_utc())?],
            )
            .context("failed to update run phase")?;
        if changed == 0 {
            return Err(ColonyError::NotFound(format!("run {run_id}")).into());
        }
        Ok(())
    }

    fn insert_node_execution(&self, execution: &NodeExecution) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO node_executions({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    execution.exec_id.to_string(),
                    execution.run_id.to_string(),
                    execution.node_id,
                    execution.node_name,
                    execution.node_type.as_str(),
                    execution.agent_id,
                    execution.status.as_str(),
                    execution.prompt,
                    execution.result_text,
                    execution.result.as_ref().map(serde_json::to_string).transpose()?,
                    serde_json::to_string(&execution.findings)?,
                    serde_json::to_string(&execution.files_modified)?,
                    execution.error_message,
                    execution.error_type,
                    execution
                        .duration_ms
                        .map(|value| u64_to_sql(value, "duration_ms"))
                        .transpose()?,
                    rfc3339(execution.created_at)?,
                    rfc3339(execution.started_at)?,
                    execution.ended_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert node execution")?;
        Ok(())
    }

    fn get_node_execution(&self, exec_id: NodeExecutionId) -> Result<Option<NodeExecution>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM node_executions WHERE exec_id = ?1"
        ))?;
        let mut rows = stmt.query(params![exec_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(execution_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn complete_node_execution(
        &self,
        exec_id: NodeExecutionId,
        completion: &NodeCompletion,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start completion transaction")?;
        let run_id = running_execution_run(&tx, exec_id, NodeExecutionStatus::Completed)?;
        let now = rfc3339(now_utc())?;

        tx.execute(
            "UPDATE node_executions SET
                status = 'completed',
                agent_id = COALESCE(?2, agent_id),
                result_text = ?3,
                result_json = ?4,
                findings_json = ?5,
                files_modified_json = ?6,
                duration_ms = ?7,
                ended_at = ?8
             WHERE exec_id = ?1",
            params![
                exec_id.to_string(),
                completion.agent_id,
                completion.result_text,
                completion.result.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&completion.findings)?,
                serde_json::to_string(&completion.files_modified)?,
                completion
                    .duration_ms
                    .map(|value| u64_to_sql(value, "duration_ms"))
                    .transpose()?,
                now,
            ],
        )
        .context("failed to complete node execution")?;

        tx.execute(
            "UPDATE workflow_runs SET
                completed_nodes = completed_nodes + 1,
                total_nodes = total_nodes + 1,
                updated_at = ?2
             WHERE run_id = ?1",
            params![run_id, now],
        )
        .context("failed to update run counters")?;

        tx.commit().context("failed to commit completion transaction")?;
        Ok(())
    }

    fn fail_node_execution(&self, exec_id: NodeExecutionId, failure: &NodeFailure) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start failure transaction")?;
        let run_id = running_execution_run(&tx, exec_id, NodeExecutionStatus::Failed)?;
        let now = rfc3339(now_utc())?;

        tx.execute(
            "UPDATE node_executions SET
                status = 'failed',
                error_message = ?2,
                error_type = ?3,
                duration_ms = ?4,
                ended_at = ?5
             WHERE exec_id = ?1",
            params![
                exec_id.to_string(),
                failure.error_message,
                failure.error_type,
                failure
                    .duration_ms
                    .map(|value| u64_to_sql(value, "duration_ms"))
                    .transpose()?,
                now,
            ],
        )
        .context("failed to record node failure")?;

        tx.execute(
            "UPDATE workflow_runs SET
                failed_nodes = failed_nodes + 1,
                total_nodes = total_nodes + 1,
                updated_at = ?2
             WHERE run_id = ?1",
            params![run_id, now],
        )
        .context("failed to update run counters")?;

        tx.commit().context("failed to commit failure transaction")?;
        Ok(())
    }

    fn list_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM node_executions WHERE run_id = ?1 ORDER BY rowid ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(execution_from_row(row)?);
        }
        // Stable sort keeps insertion order for equal timestamps.
        out.sort_by_key(|execution| execution.created_at);
        Ok(out)
    }

    fn append_decision(&self, decision: &ConductorDecision) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO conductor_decisions(
                    decision_id, run_id, node_id, decision_type, reason, payload_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    decision.decision_id.to_string(),
                    decision.run_id.to_string(),
                    decision.node_id,
                    decision.decision_type.as_str(),
                    decision.reason,
                    serde_json::to_string(&decision.payload)?,
                    rfc3339(decision.created_at)?,
                ],
            )
            .context("failed to append conductor decision")?;
        Ok(())
    }

    fn list_decisions(&self, run_id: RunId) -> Result<Vec<ConductorDecision>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, run_id, node_id, decision_type, reason, payload_json, created_at
             FROM conductor_decisions WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let decision_type: String = row.get(3)?;
            let payload_json: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            out.push(ConductorDecision {
                decision_id: DecisionId::parse(&row.get::<_, String>(0)?)?,
                run_id: RunId::parse(&row.get::<_, String>(1)?)?,
                node_id: row.get(2)?,
                decision_type: DecisionType::parse(&decision_type)
                    .ok_or_else(|| anyhow!("unknown decision type: {decision_type}"))?,
                reason: row.get(4)?,
                payload: serde_json::from_str(&payload_json)
                    .context("invalid conductor_decisions.payload_json")?,
                created_at: parse_time(&created_at)?,
            });
        }
        Ok(out)
    }
}

fn workflow_from_parts(
    conn: &Connection,
    workflow_id: &str,
    name: String,
    description: String,
    nodes_json: &str,
    created_at: &str,
) -> Result<WorkflowDefinition> {
    let nodes: Vec<WorkflowNode> =
        serde_json::from_str(nodes_json).context("invalid workflows.nodes_json")?;

    let mut stmt = conn.prepare(
        "SELECT from_node, to_node FROM workflow_edges WHERE workflow_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![workflow_id])?;
    let mut edges = Vec::new();
    while let Some(row) = rows.next()? {
        edges.push(WorkflowEdge {
            from: row.get(0)?,
            to: row.get(1)?,
        });
    }

    Ok(WorkflowDefinition {
        workflow_id: WorkflowId::parse(workflow_id)?,
        name,
        description,
        nodes,
        edges,
        created_at: parse_time(created_at)?,
    })
}

fn current_run_status(conn: &Connection, run_id: RunId) -> Result<RunStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM workflow_runs WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to load run status")?;
    let status = status.ok_or_else(|| ColonyError::NotFound(format!("run {run_id}")))?;
    RunStatus::parse(&status).ok_or_else(|| anyhow!("unknown run status: {status}"))
}

/// Returns the owning run id when the execution may move to `next`.
fn running_execution_run(
    conn: &Connection,
    exec_id: NodeExecutionId,
    next: NodeExecutionStatus,
) -> Result<String> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT run_id, status FROM node_executions WHERE exec_id = ?1",
            params![exec_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to load node execution")?;
    let (run_id, status) =
        row.ok_or_else(|| ColonyError::NotFound(format!("node execution {exec_id}")))?;

    let current = NodeExecutionStatus::parse(&status)
        .ok_or_else(|| anyhow!("unknown node execution status: {status}"))?;
    if !current.can_transition_to(next) {
        return Err(ColonyError::InvalidTransition(format!(
            "node execution {exec_id} is already {}",
            current.as_str()
        ))
        .into());
    }
    Ok(run_id)
}

fn run_from_row(row: &Row<'_>) -> Result<WorkflowRun> {
    let run_id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let started_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let input_json: String = row.get(10)?;
    let output_json: Option<String> = row.get(11)?;
    let context_json: String = row.get(12)?;

    Ok(WorkflowRun {
        run_id: RunId::parse(&run_id)?,
        workflow_name: row.get(1)?,
        status: RunStatus::parse(&status).ok_or_else(|| anyhow!("unknown run status: {status}"))?,
        phase: row.get(3)?,
        total_nodes: u32_from_sql(row.get(4)?, "total_nodes")?,
        completed_nodes: u32_from_sql(row.get(5)?, "completed_nodes")?,
        failed_nodes: u32_from_sql(row.get(6)?, "failed_nodes")?,
        started_at: parse_time(&started_at)?,
        updated_at: parse_time(&updated_at)?,
        ended_at: parse_optional_time(row.get(9)?)?,
        input: serde_json::from_str(&input_json).context("invalid workflow_runs.input_json")?,
        output: output_json
            .map(|value| serde_json::from_str(&value).context("invalid workflow_runs.output_json"))
            .transpose()?,
        context: serde_json::from_str(&context_json)
            .context("invalid workflow_runs.context_json")?,
    })
}

fn execution_from_row(row: &Row<'_>) -> Result<NodeExecution> {
    let exec_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let node_type: String = row.get(4)?;
    let status: String = row.get(6)?;
    let result_json: Option<String> = row.get(9)?;
    let findings_json: String = row.get(10)?;
    let files_modified_json: String = row.get(11)?;
    let duration_ms: Option<i64> = row.get(14)?;
    let created_at: String = row.get(15)?;
    let started_at: String = row.get(16)?;

    Ok(NodeExecution {
        exec_id: NodeExecutionId::parse(&exec_id)?,
        run_id: RunId::parse(&run_id)?,
        node_id: row.get(2)?,
        node_name: row.get(3)?,
        node_type: NodeType::parse(&node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?,
        agent_id: row.get(5)?,
        status: NodeExecutionStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown node execution status: {status}"))?,
        prompt: row.get(7)?,
        result_text: row.get(8)?,
        result: result_json
            .map(|value| serde_json::from_str(&value).context("invalid node_executions.result_json"))
            .transpose()?,
        findings: serde_json::from_str(&findings_json)
            .context("invalid node_executions.findings_json")?,
        files_modified: serde_json::from_str(&files_modified_json)
            .context("invalid node_executions.files_modified_json")?,
        error_message: row.get(12)?,
        error_type: row.get(13)?,
        duration_ms: duration_ms
            .map(|value| u64_from_sql(value, "duration_ms"))
            .transpose()?,
        created_at: parse_time(&created_at)?,
        started_at: parse_time(&started_at)?,
        ended_at: parse_optional_time(row.get(17)?)?,
    })
}
