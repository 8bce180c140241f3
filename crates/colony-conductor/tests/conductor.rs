#![allow(clippy::too_many_lines)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use colony_conductor::{
    parse_workflow_yaml, Conductor, EchoExecutor, NodeExecutor, NodeInvocation, NodeOutcome,
    ReplayManager,
};
use colony_domain::{
    ColonyError, DecisionType, ErrorEnvelope, ErrorKind, NewTrail, NodeConfig,
    NodeExecutionStatus, NodeResult, NodeType, RunStatus, Scent, TrailQuery, WorkflowEdge,
    WorkflowNode, END_NODE, START_NODE,
};
use colony_store_core::{ConductorStore, NodeCompletion, TrailStore};
use colony_store_sqlite::SqliteColonyStore;
use serde_json::json;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("colony-conductor-{name}-{}.sqlite3", Ulid::new()))
}

fn fixture_store(name: &str) -> SqliteColonyStore {
    let store = must(SqliteColonyStore::open(&temp_db_path(name)));
    must(store.migrate());
    store
}

fn single(id: &str) -> WorkflowNode {
    WorkflowNode {
        id: id.to_string(),
        name: id.to_uppercase(),
        node_type: NodeType::Single,
        prompt: format!("{id} {{target}}"),
        config: NodeConfig::default(),
    }
}

fn linear_edges(ids: &[&str]) -> Vec<WorkflowEdge> {
    let mut edges = vec![WorkflowEdge::new(START_NODE, ids[0])];
    for pair in ids.windows(2) {
        edges.push(WorkflowEdge::new(pair[0], pair[1]));
    }
    edges.push(WorkflowEdge::new(ids[ids.len() - 1], END_NODE));
    edges
}

fn kind_of(err: &anyhow::Error) -> ErrorKind {
    ErrorEnvelope::from_anyhow(err).kind
}

/// Fails the listed invocation ids until healed; records every call.
#[derive(Default)]
struct ScriptedExecutor {
    failures: RefCell<BTreeMap<String, ErrorKind>>,
    raise_timeout: RefCell<Vec<String>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedExecutor {
    fn failing(ids: &[(&str, ErrorKind)]) -> Self {
        let executor = Self::default();
        for (id, kind) in ids {
            executor.failures.borrow_mut().insert((*id).to_string(), *kind);
        }
        executor
    }

    fn heal(&self) {
        self.failures.borrow_mut().clear();
        self.raise_timeout.borrow_mut().clear();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl NodeExecutor for ScriptedExecutor {
    fn executor_name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, invocation: &NodeInvocation) -> Result<NodeOutcome> {
        self.calls.borrow_mut().push(invocation.invocation_id.clone());
        if self
            .raise_timeout
            .borrow()
            .contains(&invocation.invocation_id)
        {
            return Err(ColonyError::Timeout(format!(
                "{} exceeded {:?}ms",
                invocation.invocation_id, invocation.timeout_ms
            ))
            .into());
        }
        if let Some(kind) = self.failures.borrow().get(&invocation.invocation_id) {
            return Ok(NodeOutcome::failure(*kind, "scripted failure"));
        }

        let mut result = NodeResult::default();
        result
            .findings
            .push(json!({"from": invocation.invocation_id}));
        result
            .files_modified
            .insert(format!("src/{}.rs", invocation.node_id));
        Ok(NodeOutcome::success(
            format!("done:{}", invocation.prompt),
            result,
        ))
    }
}

#[test]
fn end_to_end_linear_run_with_trails_and_replay_plan() {
    let store = fixture_store("e2e");
    let executor = EchoExecutor::new();
    let conductor = Conductor::new(&store, &executor);

    let ids = ["collect", "analyze", "report"];
    let nodes: Vec<WorkflowNode> = ids.iter().map(|id| single(id)).collect();
    must(conductor.create_workflow("review", "linear review", nodes.clone(), linear_edges(&ids)));
    let run_id = must(conductor.start_run("review", Some(json!({"target": "src"}))));

    for node in &nodes {
        let exec_id = must(conductor.record_node_start(run_id, node, &node.prompt));
        must(conductor.record_node_completion(
            exec_id,
            &NodeCompletion {
                result_text: format!("{} ok", node.id),
                duration_ms: Some(3),
                ..NodeCompletion::default()
            },
        ));
        must(store.lay_trail(
            &NewTrail::new(
                format!("src/{}.rs", node.id),
                Scent::Discovery,
                "agent-1",
                format!("{} visited", node.id),
            )
            .with_run(run_id),
        ));
    }
    must(conductor.update_run_status(run_id, RunStatus::Completed));

    let executions = must(conductor.get_node_executions(run_id));
    assert_eq!(executions.len(), 3);
    assert!(executions
        .iter()
        .all(|execution| execution.status == NodeExecutionStatus::Completed));

    let trails = must(store.get_trails(&TrailQuery {
        run_id: Some(run_id),
        ..TrailQuery::default()
    }));
    assert_eq!(trails.len(), 3);

    let run = must(conductor.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_nodes, 3);
    assert_eq!(run.total_nodes, 3);
    assert!(run.ended_at.is_some());

    let plan = must(ReplayManager::new(&store).get_replay_plan(run_id, "analyze"));
    assert_eq!(plan.nodes_to_skip, vec!["collect"]);
    assert_eq!(plan.nodes_to_replay, vec!["analyze", "report"]);

    let first = must(ReplayManager::new(&store).get_replay_plan(run_id, "collect"));
    assert!(first.nodes_to_skip.is_empty());
    assert_eq!(first.nodes_to_replay.len(), 3);

    match ReplayManager::new(&store).get_replay_plan(run_id, "deploy") {
        Ok(_) => panic!("unknown node should not produce a plan"),
        Err(err) => assert_eq!(kind_of(&err), ErrorKind::NotFound),
    }
}

#[test]
fn run_workflow_skips_downstream_of_failures() {
    let yaml = r"
name: audit
nodes:
  - id: scan
    name: Scan
    prompt: 'scan {target}'
  - id: analyze
    name: Analyze
    type: swarm
    prompt: 'analyze {scan}'
    config:
      roles: [security, perf]
  - id: lint
    name: Lint
  - id: report
    name: Report
edges:
  - { from: __start__, to: scan }
  - { from: scan, to: analyze }
  - { from: __start__, to: lint }
  - { from: analyze, to: report }
  - { from: lint, to: report }
  - { from: report, to: __end__ }
";
    let document = must(parse_workflow_yaml(yaml));
    let store = fixture_store("run-workflow");
    let executor = ScriptedExecutor::failing(&[("lint", ErrorKind::Execution)]);
    let conductor = Conductor::new(&store, &executor);
    must(conductor.create_workflow_from_document(&document));

    let summary = must(conductor.run_workflow("audit", json!({"target": "src"})));
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.nodes_total, 4);
    assert_eq!(summary.nodes_completed, 2);
    assert_eq!(summary.nodes_failed, 1);
    assert_eq!(summary.nodes_skipped, 1);

    assert_eq!(
        executor.calls(),
        vec!["scan", "lint", "analyze-security-0", "analyze-perf-1"]
    );

    let executions = must(conductor.get_node_executions(summary.run_id));
    let analyze = executions
        .iter()
        .find(|execution| execution.node_id == "analyze")
        .unwrap_or_else(|| panic!("analyze missing"));
    assert_eq!(analyze.prompt, "analyze done:scan src");
    assert_eq!(analyze.findings.len(), 2);
    assert_eq!(analyze.files_modified, vec!["src/analyze.rs"]);

    let decisions = must(conductor.get_decisions(summary.run_id));
    let kinds: Vec<DecisionType> = decisions.iter().map(|d| d.decision_type).collect();
    assert_eq!(
        kinds,
        vec![
            DecisionType::Route,
            DecisionType::Route,
            DecisionType::Route,
            DecisionType::SkipNode,
            DecisionType::FinishRun,
        ]
    );
    assert_eq!(decisions[3].node_id.as_deref(), Some("report"));

    let run = must(conductor.get_run(summary.run_id)).unwrap_or_else(|| panic!("run missing"));
    assert_eq!(run.failed_nodes, 1);
    assert_eq!(run.completed_nodes, 2);
    assert!(run.output.is_some());
}

#[test]
fn invalid_sub_invocation_never_reaches_executor() {
    let store = fixture_store("short-circuit");
    let executor = ScriptedExecutor::default();
    let conductor = Conductor::new(&store, &executor);

    let node = WorkflowNode {
        id: "fanout".to_string(),
        name: "Fan out".to_string(),
        node_type: NodeType::Swarm,
        prompt: "go".to_string(),
        config: NodeConfig {
            roles: vec!["ok".to_string(), "rm -rf".to_string()],
            ..NodeConfig::default()
        },
    };
    must(conductor.create_workflow(
        "fan",
        "",
        vec![node.clone()],
        linear_edges(&["fanout"]),
    ));
    let run_id = must(conductor.start_run("fan", None));
    let report = must(conductor.execute_node(run_id, &node, &json!({})));

    assert_eq!(report.status, NodeExecutionStatus::Failed);
    assert!(executor.calls().is_empty());
    let execution = must(store.get_node_execution(report.exec_id))
        .unwrap_or_else(|| panic!("execution missing"));
    assert_eq!(execution.error_type.as_deref(), Some("validation_error"));
}

#[test]
fn timeouts_are_recorded_once_and_never_retried() {
    let store = fixture_store("timeout");
    let executor = ScriptedExecutor::default();
    executor.raise_timeout.borrow_mut().push("slow".to_string());
    let conductor = Conductor::new(&store, &executor);

    let mut node = single("slow");
    node.config.timeout_ms = Some(50);
    must(conductor.create_workflow("slowflow", "", vec![node.clone()], linear_edges(&["slow"])));
    let run_id = must(conductor.start_run("slowflow", None));
    let report = must(conductor.execute_node(run_id, &node, &json!({})));

    assert_eq!(report.status, NodeExecutionStatus::Failed);
    assert_eq!(executor.calls(), vec!["slow"]);
    let executions = must(conductor.get_node_executions(run_id));
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].error_type.as_deref(), Some("timeout"));
    let run = must(conductor.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
    assert_eq!(run.failed_nodes, 1);
}

#[test]
fn dry_run_retry_is_read_only_and_real_retry_resubmits() {
    let store = fixture_store("retry");
    let executor = ScriptedExecutor::failing(&[("build", ErrorKind::Execution)]);
    let conductor = Conductor::new(&store, &executor);

    let ids = ["plan", "build"];
    must(conductor.create_workflow(
        "ship",
        "",
        ids.iter().map(|id| single(id)).collect(),
        linear_edges(&ids),
    ));
    let summary = must(conductor.run_workflow("ship", json!({"target": "api"})));
    assert_eq!(summary.status, RunStatus::Failed);
    let run_id = summary.run_id;

    let before = must(conductor.get_node_executions(run_id));
    let manager = ReplayManager::new(&store).with_resubmitter(&conductor);
    let dry = must(manager.retry_failed_nodes(run_id, true));
    assert_eq!(dry.failed_nodes, 1);
    assert_eq!(dry.nodes, vec!["build"]);
    assert!(dry.resubmitted.is_empty());
    assert_eq!(must(conductor.get_node_executions(run_id)), before);
    assert_eq!(executor.calls(), vec!["plan", "build"]);

    executor.heal();
    let retried = must(manager.retry_failed_nodes(run_id, false));
    assert_eq!(retried.resubmitted.len(), 1);
    assert_eq!(retried.resubmitted[0].status, NodeExecutionStatus::Completed);

    let run = must(conductor.get_run(run_id)).unwrap_or_else(|| panic!("run missing"));
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_nodes, 3);
    let decisions = must(conductor.get_decisions(run_id));
    assert!(decisions
        .iter()
        .any(|decision| decision.decision_type == DecisionType::Resubmit));

    let without = ReplayManager::new(&store);
    assert_eq!(must(without.retry_failed_nodes(run_id, true)).failed_nodes, 1);
    match without.retry_failed_nodes(run_id, false) {
        Ok(_) => panic!("resubmission without a resubmitter"),
        Err(err) => assert_eq!(kind_of(&err), ErrorKind::Validation),
    }
}

#[test]
fn workflow_names_and_runs_are_checked() {
    let store = fixture_store("names");
    let executor = EchoExecutor::new();
    let conductor = Conductor::new(&store, &executor);

    must(conductor.create_workflow("dup", "", vec![single("a")], linear_edges(&["a"])));
    match conductor.create_workflow("dup", "", vec![single("a")], linear_edges(&["a"])) {
        Ok(_) => panic!("duplicate workflow name accepted"),
        Err(err) => assert_eq!(kind_of(&err), ErrorKind::Conflict),
    }
    match conductor.start_run("missing", None) {
        Ok(_) => panic!("run started for unknown workflow"),
        Err(err) => assert_eq!(kind_of(&err), ErrorKind::NotFound),
    }
    assert!(must(conductor.get_workflow("missing")).is_none());

    let run_id = must(conductor.start_run("dup", None));
    must(conductor.update_run_status(run_id, RunStatus::Completed));
    match conductor.record_node_start(run_id, &single("a"), "late") {
        Ok(_) => panic!("node started on a finished run"),
        Err(err) => assert_eq!(kind_of(&err), ErrorKind::InvalidTransition),
    }
}
