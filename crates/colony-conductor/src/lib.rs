#![forbid(unsafe_code)]

mod definition;
mod executor;
mod replay;

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{anyhow, Result};
use colony_domain::{
    now_utc, validate_identifier, ColonyError, ConductorDecision, DecisionId, DecisionType,
    ErrorEnvelope, ErrorKind, NodeExecution, NodeExecutionId, NodeExecutionStatus, NodeResult,
    NodeType, RunId, RunStatus, WorkflowDefinition, WorkflowEdge, WorkflowId, WorkflowNode,
    WorkflowRun,
};
use colony_store_core::{ConductorStore, NodeCompletion, NodeFailure};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub use definition::{
    load_workflow_from_path, parse_workflow_yaml, topological_order, validate_definition,
    WorkflowDocument,
};
pub use executor::{EchoExecutor, NodeExecutor, NodeInvocation, NodeOutcome};
pub use replay::{NodeResubmitter, ReplayManager, ReplayPlan, ResubmittedNode, RetryReport};

/// What `execute_node` recorded for one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeReport {
    pub exec_id: NodeExecutionId,
    pub node_id: String,
    pub status: NodeExecutionStatus,
    pub result_text: String,
    pub result: NodeResult,
    pub invocations: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub nodes_total: usize,
    pub nodes_completed: usize,
    pub nodes_failed: usize,
    pub nodes_skipped: usize,
}

/// Workflow engine over a persisted DAG. Every node execution and routing
/// decision is written to the store as it happens.
pub struct Conductor<'a> {
    store: &'a dyn ConductorStore,
    executor: &'a dyn NodeExecutor,
}

impl<'a> Conductor<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ConductorStore, executor: &'a dyn NodeExecutor) -> Self {
        Self { store, executor }
    }

    /// # Errors
    /// Returns `Validation` for a malformed definition and `Conflict` when the
    /// name is already taken.
    pub fn create_workflow(
        &self,
        name: &str,
        description: &str,
        nodes: Vec<WorkflowNode>,
        edges: Vec<WorkflowEdge>,
    ) -> Result<WorkflowId> {
        validate_definition(name, &nodes, &edges)?;
        let workflow = WorkflowDefinition {
            workflow_id: WorkflowId::new(),
            name: name.to_string(),
            description: description.to_string(),
            nodes,
            edges,
            created_at: now_utc(),
        };
        self.store.insert_workflow(&workflow)?;
        tracing::info!(
            workflow = name,
            workflow_id = %workflow.workflow_id,
            nodes = workflow.nodes.len(),
            "workflow created"
        );
        Ok(workflow.workflow_id)
    }

    /// # Errors
    /// Same as [`Conductor::create_workflow`].
    pub fn create_workflow_from_document(&self, document: &WorkflowDocument) -> Result<WorkflowId> {
        self.create_workflow(
            &document.name,
            &document.description,
            document.nodes.clone(),
            document.edges.clone(),
        )
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub fn get_workflow(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        self.store.get_workflow_by_name(name)
    }

    /// # Errors
    /// Returns `NotFound` for an unknown workflow.
    pub fn start_run(&self, workflow_name: &str, input: Option<Value>) -> Result<RunId> {
        if self.store.get_workflow_by_name(workflow_name)?.is_none() {
            return Err(ColonyError::NotFound(format!("workflow {workflow_name}")).into());
        }

        let now = now_utc();
        let run = WorkflowRun {
            run_id: RunId::new(),
            workflow_name: workflow_name.to_string(),
            status: RunStatus::Running,
            phase: None,
            total_nodes: 0,
            completed_nodes: 0,
            failed_nodes: 0,
            started_at: now,
            updated_at: now,
            ended_at: None,
            input: input.unwrap_or_else(|| Value::Object(Map::default())),
            output: None,
            context: Value::Object(Map::default()),
        };
        self.store.insert_run(&run)?;
        tracing::info!(workflow = workflow_name, run_id = %run.run_id, "run started");
        Ok(run.run_id)
    }

    /// # Errors
    /// Returns `NotFound` for an unknown run and `InvalidTransition` when the
    /// run is no longer running.
    pub fn record_node_start(
        &self,
        run_id: RunId,
        node: &WorkflowNode,
        prompt: &str,
    ) -> Result<NodeExecutionId> {
        let run = self.require_run(run_id)?;
        if run.status != RunStatus::Running {
            return Err(ColonyError::InvalidTransition(format!(
                "run {run_id} is {}, node {} cannot start",
                run.status.as_str(),
                node.id
            ))
            .into());
        }

        let now = now_utc();
        let execution = NodeExecution {
            exec_id: NodeExecutionId::new(),
            run_id,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type,
            agent_id: None,
            status: NodeExecutionStatus::Running,
            prompt: prompt.to_string(),
            result_text: None,
            result: None,
            findings: Vec::new(),
            files_modified: Vec::new(),
            error_message: None,
            error_type: None,
            duration_ms: None,
            created_at: now,
            started_at: now,
            ended_at: None,
        };
        self.store.insert_node_execution(&execution)?;
        Ok(execution.exec_id)
    }

    /// # Errors
    /// Returns `NotFound` or `InvalidTransition` when the execution is unknown
    /// or already terminal.
    pub fn record_node_completion(
        &self,
        exec_id: NodeExecutionId,
        completion: &NodeCompletion,
    ) -> Result<()> {
        self.store.complete_node_execution(exec_id, completion)
    }

    /// # Errors
    /// Returns `NotFound` or `InvalidTransition` when the execution is unknown
    /// or already terminal.
    pub fn record_node_failure(&self, exec_id: NodeExecutionId, failure: &NodeFailure) -> Result<()> {
        self.store.fail_node_execution(exec_id, failure)
    }

    /// # Errors
    /// Returns `NotFound` or `InvalidTransition` per the run status table.
    pub fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<()> {
        self.store.update_run_status(run_id, status, None)
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub fn get_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>> {
        self.store.list_node_executions(run_id)
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        self.store.get_run(run_id)
    }

    /// # Errors
    /// Returns an error if the store read fails.
    pub fn get_decisions(&self, run_id: RunId) -> Result<Vec<ConductorDecision>> {
        self.store.list_decisions(run_id)
    }

    /// Run one node through the executor and record the outcome as a node
    /// execution.
    ///
    /// Executor failures, including timeouts, become a failed execution rather
    /// than an error; only store failures are returned as `Err`.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or not running, or when the
    /// store write fails.
    pub fn execute_node(
        &self,
        run_id: RunId,
        node: &WorkflowNode,
        context: &Value,
    ) -> Result<NodeReport> {
        let started = Instant::now();
        let prompt = render_prompt(&node.prompt, context);
        let exec_id = self.record_node_start(run_id, node, &prompt)?;

        let invocations = match plan_invocations(run_id, node, &prompt, context) {
            Ok(invocations) => invocations,
            Err(err) => {
                let envelope = ErrorEnvelope::from(&err);
                tracing::warn!(node_id = node.id.as_str(), error = %err, "node rejected before dispatch");
                self.record_node_failure(
                    exec_id,
                    &NodeFailure {
                        error_message: envelope.message.clone(),
                        error_type: Some(envelope.code.clone()),
                        duration_ms: Some(elapsed_ms(started)),
                    },
                )?;
                return Ok(NodeReport {
                    exec_id,
                    node_id: node.id.clone(),
                    status: NodeExecutionStatus::Failed,
                    result_text: envelope.message.clone(),
                    result: NodeResult::failed(envelope),
                    invocations: 0,
                    succeeded: 0,
                });
            }
        };

        let outcomes: Vec<NodeOutcome> = invocations
            .iter()
            .map(|invocation| self.invoke(invocation))
            .collect();
        let aggregate = aggregate_outcomes(node.node_type, &invocations, &outcomes);
        let duration_ms = Some(elapsed_ms(started));

        let status = if let Some(error) = &aggregate.result.error {
            self.record_node_failure(
                exec_id,
                &NodeFailure {
                    error_message: error.message.clone(),
                    error_type: Some(error.code.clone()),
                    duration_ms,
                },
            )?;
            NodeExecutionStatus::Failed
        } else {
            self.record_node_completion(
                exec_id,
                &NodeCompletion {
                    result_text: aggregate.result_text.clone(),
                    result: Some(serde_json::to_value(&aggregate.result)?),
                    findings: aggregate.result.findings.clone(),
                    files_modified: aggregate.result.files_modified.iter().cloned().collect(),
                    agent_id: aggregate.agent_id.clone(),
                    duration_ms,
                },
            )?;
            NodeExecutionStatus::Completed
        };

        Ok(NodeReport {
            exec_id,
            node_id: node.id.clone(),
            status,
            result_text: aggregate.result_text,
            result: aggregate.result,
            invocations: invocations.len(),
            succeeded: aggregate.succeeded,
        })
    }

    /// Walk the workflow from `__start__` in dependency order, one node at a
    /// time. Nodes downstream of a failure are skipped, not executed.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown workflow, or any store failure.
    pub fn run_workflow(&self, workflow_name: &str, input: Value) -> Result<RunSummary> {
        let workflow = self
            .get_workflow(workflow_name)?
            .ok_or_else(|| ColonyError::NotFound(format!("workflow {workflow_name}")))?;
        let order = topological_order(&workflow.nodes, &workflow.edges)?;
        let mut context = match &input {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::default();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        let run_id = self.start_run(workflow_name, Some(input))?;

        let mut completed = 0_usize;
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        for node_id in &order {
            let node = workflow
                .node(node_id)
                .ok_or_else(|| anyhow!("workflow {workflow_name} lost node {node_id}"))?;

            let blocked_by: Vec<&str> = workflow
                .predecessors(node_id)
                .into_iter()
                .filter(|pred| failed.contains(*pred) || skipped.contains(*pred))
                .collect();
            if !blocked_by.is_empty() {
                self.decide(
                    run_id,
                    Some(node_id),
                    DecisionType::SkipNode,
                    "predecessor did not complete",
                    json!({ "blocked_by": blocked_by }),
                )?;
                skipped.insert(node_id.clone());
                continue;
            }

            self.decide(
                run_id,
                Some(node_id),
                DecisionType::Route,
                "dependencies satisfied",
                json!({ "node_type": node.node_type.as_str() }),
            )?;
            self.store.update_run_phase(run_id, node_id)?;

            let report = self.execute_node(run_id, node, &Value::Object(context.clone()))?;
            match report.status {
                NodeExecutionStatus::Completed => {
                    completed += 1;
                    context.insert(node_id.clone(), Value::String(report.result_text));
                }
                NodeExecutionStatus::Failed | NodeExecutionStatus::Running => {
                    failed.insert(node_id.clone());
                }
            }
        }

        let status = if failed.is_empty() && skipped.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let output = json!({
            "completed": completed,
            "failed": failed,
            "skipped": skipped,
        });
        self.decide(
            run_id,
            None,
            DecisionType::FinishRun,
            if status == RunStatus::Completed {
                "all nodes completed"
            } else {
                "one or more nodes failed"
            },
            output.clone(),
        )?;
        self.store.update_run_status(run_id, status, Some(&output))?;
        tracing::info!(
            run_id = %run_id,
            status = status.as_str(),
            completed,
            failed = failed.len(),
            skipped = skipped.len(),
            "run finished"
        );

        Ok(RunSummary {
            run_id,
            workflow_name: workflow_name.to_string(),
            status,
            nodes_total: order.len(),
            nodes_completed: completed,
            nodes_failed: failed.len(),
            nodes_skipped: skipped.len(),
        })
    }

    fn invoke(&self, invocation: &NodeInvocation) -> NodeOutcome {
        match self.executor.execute(invocation) {
            Ok(outcome) => {
                if let Some(error) = &outcome.result.error {
                    tracing::warn!(
                        executor = self.executor.executor_name(),
                        invocation_id = invocation.invocation_id.as_str(),
                        kind = error.code.as_str(),
                        "invocation reported failure"
                    );
                }
                outcome
            }
            Err(err) => {
                let envelope = ErrorEnvelope::from_anyhow(&err);
                let kind = match envelope.kind {
                    ErrorKind::Timeout => ErrorKind::Timeout,
                    ErrorKind::Validation => ErrorKind::Validation,
                    _ => ErrorKind::Execution,
                };
                tracing::warn!(
                    executor = self.executor.executor_name(),
                    invocation_id = invocation.invocation_id.as_str(),
                    kind = kind.as_str(),
                    error = %err,
                    "invocation failed"
                );
                NodeOutcome::failure(kind, envelope.message)
            }
        }
    }

    fn decide(
        &self,
        run_id: RunId,
        node_id: Option<&str>,
        decision_type: DecisionType,
        reason: &str,
        payload: Value,
    ) -> Result<()> {
        self.store.append_decision(&ConductorDecision {
            decision_id: DecisionId::new(),
            run_id,
            node_id: node_id.map(ToString::to_string),
            decision_type,
            reason: reason.to_string(),
            payload,
            created_at: now_utc(),
        })
    }

    fn require_run(&self, run_id: RunId) -> Result<WorkflowRun> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| ColonyError::NotFound(format!("run {run_id}")).into())
    }

    /// Close a reopened run from the latest execution of every node.
    fn settle_run(&self, run_id: RunId) -> Result<RunStatus> {
        let mut latest: Vec<(String, NodeExecutionStatus)> = Vec::new();
        for execution in self.store.list_node_executions(run_id)? {
            match latest.iter_mut().find(|(node_id, _)| *node_id == execution.node_id) {
                Some(entry) => entry.1 = execution.status,
                None => latest.push((execution.node_id, execution.status)),
            }
        }
        let status = if latest
            .iter()
            .all(|(_, status)| *status == NodeExecutionStatus::Completed)
        {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.store.update_run_status(run_id, status, None)?;
        Ok(status)
    }
}

impl NodeResubmitter for Conductor<'_> {
    fn resubmit(&self, run_id: RunId, node_id: &str) -> Result<ResubmittedNode> {
        validate_identifier("node_id", node_id)?;
        let run = self.require_run(run_id)?;
        let workflow = self
            .get_workflow(&run.workflow_name)?
            .ok_or_else(|| ColonyError::NotFound(format!("workflow {}", run.workflow_name)))?;
        let node = workflow.node(node_id).ok_or_else(|| {
            ColonyError::NotFound(format!("node {node_id} in workflow {}", workflow.name))
        })?;

        let reopened = run.status.is_terminal();
        if reopened {
            self.store.update_run_status(run_id, RunStatus::Running, None)?;
        }
        self.decide(
            run_id,
            Some(node_id),
            DecisionType::Resubmit,
            "retrying failed node",
            json!({ "previous_run_status": run.status.as_str() }),
        )?;

        let report = self.execute_node(run_id, node, &run.input)?;
        if reopened {
            self.settle_run(run_id)?;
        }
        Ok(ResubmittedNode {
            node_id: node_id.to_string(),
            exec_id: report.exec_id,
            status: report.status,
        })
    }
}

/// Substitute `{key}` placeholders with values from a JSON object context.
/// Strings are inserted verbatim, other values as compact JSON.
#[must_use]
pub fn render_prompt(template: &str, context: &Value) -> String {
    let Value::Object(map) = context else {
        return template.to_string();
    };
    let mut rendered = template.to_string();
    for (key, value) in map {
        let placeholder = format!("{{{key}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let text = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &text);
    }
    rendered
}

fn plan_invocations(
    run_id: RunId,
    node: &WorkflowNode,
    prompt: &str,
    context: &Value,
) -> Result<Vec<NodeInvocation>, ColonyError> {
    let make = |invocation_id: String, role: Option<String>, prompt: String| NodeInvocation {
        run_id,
        node_id: node.id.clone(),
        invocation_id,
        node_type: node.node_type,
        role,
        prompt,
        timeout_ms: node.config.timeout_ms,
        context: context.clone(),
    };

    let invocations: Vec<NodeInvocation> = match node.node_type {
        NodeType::Single => vec![make(node.id.clone(), None, prompt.to_string())],
        NodeType::Swarm => {
            let roles = &node.config.roles;
            let ants = node.config.num_ants.unwrap_or(roles.len()).min(roles.len());
            roles
                .iter()
                .take(ants)
                .enumerate()
                .map(|(i, role)| {
                    make(
                        format!("{}-{role}-{i}", node.id),
                        Some(role.clone()),
                        prompt.to_string(),
                    )
                })
                .collect()
        }
        NodeType::Parallel => node
            .config
            .prompts
            .iter()
            .enumerate()
            .map(|(i, template)| {
                make(
                    format!("{}-parallel-{i}", node.id),
                    None,
                    render_prompt(template, context),
                )
            })
            .collect(),
    };

    if invocations.is_empty() {
        return Err(ColonyError::Validation(format!(
            "{} node {} has no invocations configured",
            node.node_type.as_str(),
            node.id
        )));
    }
    for invocation in &invocations {
        validate_identifier("invocation_id", &invocation.invocation_id)?;
    }
    Ok(invocations)
}

struct Aggregate {
    result_text: String,
    result: NodeResult,
    agent_id: Option<String>,
    succeeded: usize,
}

fn aggregate_outcomes(
    node_type: NodeType,
    invocations: &[NodeInvocation],
    outcomes: &[NodeOutcome],
) -> Aggregate {
    let mut result = NodeResult::default();
    let mut texts = Vec::new();
    let mut first_error: Option<ErrorEnvelope> = None;
    let mut succeeded = 0_usize;
    let mut ledger = Vec::with_capacity(outcomes.len());

    for (invocation, outcome) in invocations.iter().zip(outcomes) {
        result.findings.extend(outcome.result.findings.iter().cloned());
        result
            .files_modified
            .extend(outcome.result.files_modified.iter().cloned());

        if let Some(error) = &outcome.result.error {
            if first_error.is_none() {
                first_error = Some(error.clone());
            }
            ledger.push(json!({
                "invocation_id": invocation.invocation_id,
                "status": "failed",
                "error": error.code,
            }));
            continue;
        }

        succeeded += 1;
        texts.push(outcome.result_text.clone());
        ledger.push(json!({
            "invocation_id": invocation.invocation_id,
            "status": "completed",
        }));
        if node_type == NodeType::Single {
            result.extra.clone_from(&outcome.result.extra);
        }
    }

    if node_type != NodeType::Single {
        result
            .extra
            .insert("invocations".to_string(), Value::Array(ledger));
    }

    let agent_id = if node_type == NodeType::Single {
        outcomes.first().and_then(|outcome| outcome.agent_id.clone())
    } else {
        None
    };

    if succeeded == 0 {
        let error = first_error.unwrap_or_else(|| {
            ErrorEnvelope::new(ErrorKind::Execution, "no invocation succeeded")
        });
        return Aggregate {
            result_text: error.message.clone(),
            result: NodeResult {
                error: Some(error),
                ..result
            },
            agent_id,
            succeeded,
        };
    }

    Aggregate {
        result_text: texts.join("\n"),
        result,
        agent_id,
        succeeded,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
