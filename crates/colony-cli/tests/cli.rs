#![allow(clippy::too_many_lines)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const WORKFLOW_YAML: &str = r"
name: triage
description: collect then summarize
nodes:
  - id: collect
    name: Collect
    prompt: 'collect {target}'
  - id: fanout
    name: Fanout
    type: parallel
    config:
      prompts: ['check {target}', 'measure {target}']
  - id: summarize
    name: Summarize
    prompt: 'summarize {collect}'
edges:
  - { from: __start__, to: collect }
  - { from: collect, to: fanout }
  - { from: fanout, to: summarize }
  - { from: summarize, to: __end__ }
";

fn temp_base(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("colony-cli-{name}-{}", Ulid::new()))
}

fn colony(base: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_colony"));
    command.arg("--base-dir").arg(base).env("RUST_LOG", "warn");
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run colony {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn ok_json(base: &Path, args: &[&str]) -> Value {
    let output = colony(base, args);
    assert!(
        output.status.success(),
        "colony {args:?} failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    stdout_json(&output)
}

#[test]
fn help_lists_command_groups() {
    let output = match Command::new(env!("CARGO_BIN_EXE_colony"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["events", "guard", "trails", "workflow", "run", "replay"] {
        assert!(stdout.contains(required), "missing subcommand {required}");
    }
}

#[test]
fn guard_writes_land_in_both_stores() {
    let base = temp_base("guard");

    let agent = ok_json(
        &base,
        &[
            "guard",
            "apply",
            "--event-json",
            r#"{"type":"agent.registered","payload":{"agent_id":"scout","task":"map modules"}}"#,
        ],
    );
    assert_eq!(agent["status"], "active");

    let finding = ok_json(
        &base,
        &[
            "guard",
            "apply",
            "--event-json",
            r#"{"type":"finding.added","payload":{"agent_id":"scout","finding_type":"risk","importance":8,"content":"unbounded queue"}}"#,
        ],
    );
    assert_eq!(finding["id"], "finding-2");

    let stats = ok_json(&base, &["events", "stats"]);
    assert_eq!(stats["total_events"], 2);
    assert_eq!(stats["last_seq"], 2);

    let since = ok_json(&base, &["events", "since", "--cursor", "1"]);
    assert_eq!(since["findings"].as_array().map(Vec::len), Some(1));

    let report = ok_json(&base, &["guard", "validate"]);
    assert_eq!(report["divergences"].as_array().map(Vec::len), Some(0));
    assert_eq!(report["health_after"], "healthy");

    let verify = ok_json(&base, &["events", "verify"]);
    assert!(verify["problems"].as_array().is_some_and(Vec::is_empty));

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn workflow_run_and_replay_plan() {
    let base = temp_base("workflow");
    must_create_dir(&base);
    let yaml_path = base.join("triage.yaml");
    if let Err(err) = fs::write(&yaml_path, WORKFLOW_YAML) {
        panic!("failed to write workflow fixture: {err}");
    }
    let yaml_arg = yaml_path.to_string_lossy().to_string();

    let created = ok_json(&base, &["workflow", "create", "--file", &yaml_arg]);
    assert_eq!(created["name"], "triage");

    let duplicate = colony(&base, &["workflow", "create", "--file", &yaml_arg]);
    assert!(!duplicate.status.success());
    assert_eq!(stdout_json(&duplicate)["error"]["kind"], "conflict");

    let summary = ok_json(
        &base,
        &["workflow", "run", "--name", "triage", "--input-json", r#"{"target":"api"}"#],
    );
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["nodes_completed"], 3);
    let run_id = summary["run_id"].as_str().map(str::to_string).unwrap_or_default();

    let shown = ok_json(&base, &["run", "show", "--run-id", &run_id]);
    assert_eq!(shown["node_executions"].as_array().map(Vec::len), Some(3));
    let decisions: Vec<&str> = shown["decisions"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["decision_type"].as_str())
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(decisions, vec!["route", "route", "route", "finish_run"]);

    let plan = ok_json(
        &base,
        &["replay", "plan", "--run-id", &run_id, "--from-node", "fanout"],
    );
    assert_eq!(plan["nodes_to_skip"], serde_json::json!(["collect"]));
    assert_eq!(plan["nodes_to_replay"], serde_json::json!(["fanout", "summarize"]));

    let retry = ok_json(&base, &["replay", "retry", "--run-id", &run_id, "--dry-run"]);
    assert_eq!(retry["failed_nodes"], 0);

    let missing = colony(
        &base,
        &["replay", "plan", "--run-id", &run_id, "--from-node", "deploy"],
    );
    assert!(!missing.status.success());
    assert_eq!(stdout_json(&missing)["error"]["kind"], "not_found");

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn trails_lay_aggregate_and_decay() {
    let base = temp_base("trails");

    for (agent, strength) in [("scout", "0.8"), ("worker", "0.4")] {
        let trail = ok_json(
            &base,
            &[
                "trails",
                "lay",
                "--location",
                "src/queue.rs",
                "--scent",
                "hot",
                "--agent-id",
                agent,
                "--message",
                "contention here",
                "--strength",
                strength,
            ],
        );
        assert_eq!(trail["scent"], "hot");
    }

    let hotspots = ok_json(&base, &["trails", "hotspots"]);
    assert_eq!(hotspots[0]["location"], "src/queue.rs");
    assert_eq!(hotspots[0]["trail_count"], 2);

    let decay = ok_json(&base, &["trails", "decay", "--rate", "0.5"]);
    assert_eq!(decay["trails_updated"], 2);

    let trails = ok_json(&base, &["trails", "list", "--scent", "hot"]);
    let strongest = trails[0]["strength"].as_f64().unwrap_or_default();
    assert!((strongest - 0.4).abs() < 1e-9);

    let rejected = colony(
        &base,
        &[
            "trails",
            "lay",
            "--location",
            "src/queue.rs",
            "--scent",
            "warning",
            "--agent-id",
            "scout",
            "--message",
            "too strong",
            "--strength",
            "1.5",
        ],
    );
    assert!(!rejected.status.success());
    assert_eq!(stdout_json(&rejected)["error"]["kind"], "validation");

    let _ = fs::remove_dir_all(&base);
}

fn must_create_dir(path: &Path) {
    if let Err(err) = fs::create_dir_all(path) {
        panic!("failed to create {}: {err}", path.display());
    }
}
