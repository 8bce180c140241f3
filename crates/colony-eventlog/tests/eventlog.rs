#![allow(clippy::too_many_lines)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use colony_domain::{
    AgentCursorUpdated, AgentRegistered, ContextSet, ErrorKind, Event, FindingAdded, TaskAdded,
    TaskCompleted,
};
use colony_eventlog::EventLog;
use serde_json::json;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("colony-eventlog-{name}-{}.jsonl", Ulid::new()))
}

fn register(agent_id: &str) -> Event {
    Event::AgentRegistered(AgentRegistered {
        agent_id: agent_id.to_string(),
        task: "review storage layer".to_string(),
        scope: vec!["src/storage".to_string()],
        interests: Vec::new(),
    })
}

fn finding(agent_id: &str, content: &str) -> Event {
    Event::FindingAdded(FindingAdded {
        agent_id: agent_id.to_string(),
        finding_type: "observation".to_string(),
        tags: vec!["storage".to_string()],
        importance: 5,
        content: content.to_string(),
    })
}

fn append_raw(path: &PathBuf, bytes: &[u8]) {
    let mut file = match OpenOptions::new().append(true).open(path) {
        Ok(file) => file,
        Err(err) => panic!("failed to open log for raw append: {err}"),
    };
    if let Err(err) = file.write_all(bytes) {
        panic!("raw append failed: {err}");
    }
}

#[test]
fn sequence_numbers_are_gapless_and_survive_reopen() {
    let path = temp_log("seq");
    let mut log = EventLog::new(&path);
    for expected in 1..=5 {
        assert_eq!(must(log.append_event(&finding("a1", "f"))), expected);
    }
    drop(log);

    let mut reopened = EventLog::new(&path);
    assert_eq!(must(reopened.append_event(&finding("a1", "g"))), 6);
    let stats = must(reopened.get_stats());
    assert_eq!(stats.total_events, 6);
    assert_eq!(stats.last_seq, 6);
    assert_eq!(stats.corrupt_records, 0);
    assert!(stats.file_size_bytes > 0);

    let _ = fs::remove_file(&path);
}

#[test]
fn crash_recovery_keeps_every_complete_record() {
    let path = temp_log("crash");
    let n = 4;
    let m = 3;

    let mut first = EventLog::new(&path);
    for index in 0..n {
        must(first.append_event(&finding("a1", &format!("before-{index}"))));
    }
    drop(first);

    // Simulate a writer that died mid-record.
    append_raw(&path, br#"{"seq":5,"type":"finding.added","payload":{"agent_"#);

    let mut second = EventLog::new(&path);
    for index in 0..m {
        must(second.append_event(&finding("a2", &format!("after-{index}"))));
    }

    let state = must(second.get_current_state());
    assert_eq!(state.findings.len(), n + m);
    let stats = must(second.get_stats());
    assert_eq!(stats.corrupt_records, 1);
    assert_eq!(stats.total_events, n + m);

    let report = must(second.verify());
    assert_eq!(report.problems.len(), 1);
    assert_eq!(report.problems[0].line, n + 1);
    assert_eq!(report.problems[0].kind, ErrorKind::Corruption);

    let _ = fs::remove_file(&path);
}

#[test]
fn tampered_records_are_skipped_and_counted() {
    let path = temp_log("tamper");
    let mut log = EventLog::new(&path);
    must(log.append_event(&finding("a1", "original")));
    must(log.append_event(&finding("a1", "second")));

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => panic!("read failed: {err}"),
    };
    let tampered = content.replacen("original", "forged", 1);
    if let Err(err) = fs::write(&path, tampered) {
        panic!("write failed: {err}");
    }

    let mut reader = EventLog::new(&path);
    let state = must(reader.get_current_state());
    assert_eq!(state.findings.len(), 1);
    assert_eq!(state.findings[0].id, "finding-2");
    assert_eq!(must(reader.scan_report()).corrupt, 1);

    let report = must(reader.verify());
    assert!(!report.is_clean());
    assert_eq!(report.problems[0].seq, Some(1));

    let _ = fs::remove_file(&path);
}

#[test]
fn forged_sequence_numbers_do_not_steer_appends() {
    let path = temp_log("forged-seq");
    let mut log = EventLog::new(&path);
    must(log.append_event(&register("a1")));
    drop(log);

    append_raw(
        &path,
        format!(
            "{{\"seq\":{},\"type\":\"finding.added\",\"timestamp\":\"2026-02-07T12:00:00Z\",\"payload\":{{}},\"checksum\":\"bad\"}}\n",
            u64::MAX
        )
        .as_bytes(),
    );
    append_raw(
        &path,
        br#"{"seq":1000000,"type":"finding.added","timestamp":"2026-02-07T12:00:00Z","payload":{},"checksum":"bad"}
"#,
    );

    let mut writer = EventLog::new(&path);
    assert_eq!(must(writer.append_event(&finding("a1", "after forgery"))), 2);
    assert_eq!(must(writer.append_event(&finding("a1", "still gapless"))), 3);

    let stats = must(writer.get_stats());
    assert_eq!(stats.last_seq, 3);
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.corrupt_records, 2);

    let state = must(writer.get_current_state());
    assert!(state.agents.contains_key("a1"));
    let ids: Vec<&str> = state.findings.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["finding-2", "finding-3"]);

    let report = must(writer.verify());
    assert_eq!(report.problems.len(), 2);
    assert_eq!(report.problems[0].seq, Some(u64::MAX));
    assert_eq!(report.problems[0].kind, ErrorKind::Corruption);

    let _ = fs::remove_file(&path);
}

#[test]
fn unknown_event_types_are_ignored() {
    let path = temp_log("unknown");
    let mut log = EventLog::new(&path);
    must(log.append_event(&finding("a1", "known")));

    let payload = json!({"anything": true});
    let checksum = match colony_domain::compute_checksum(2, "agent.teleported", &payload) {
        Ok(value) => value,
        Err(err) => panic!("checksum failed: {err}"),
    };
    let line = json!({
        "seq": 2,
        "type": "agent.teleported",
        "payload": payload,
        "checksum": checksum,
        "timestamp": "2026-02-07T12:00:00Z"
    });
    append_raw(&path, format!("{line}\n").as_bytes());

    let report = must(log.scan_report());
    assert_eq!(report.unknown, 1);
    assert_eq!(report.corrupt, 0);
    assert_eq!(must(log.get_current_state()).findings.len(), 1);

    // Unknown records still occupy their sequence number.
    assert_eq!(must(log.append_event(&finding("a1", "next"))), 3);

    let _ = fs::remove_file(&path);
}

#[test]
fn cursor_delta_returns_only_newer_findings() {
    let path = temp_log("cursor");
    let mut log = EventLog::new(&path);
    must(log.append_event(&register("a1")));
    must(log.append_event(&finding("a2", "one")));
    let cursor_seq = must(log.append_event(&Event::AgentCursorUpdated(AgentCursorUpdated {
        agent_id: "a1".to_string(),
    })));
    must(log.append_event(&finding("a2", "two")));
    must(log.append_event(&finding("a2", "three")));

    let state = must(log.get_current_state());
    let cursor = state
        .agents
        .get("a1")
        .map_or_else(|| panic!("agent a1 missing"), |agent| agent.cursor);
    assert_eq!(cursor, cursor_seq);

    let delta = must(log.get_findings_since(cursor));
    let contents: Vec<&str> = delta.iter().map(|item| item.content.as_str()).collect();
    assert_eq!(contents, vec!["two", "three"]);
    let last_seq = must(log.get_stats()).last_seq;
    assert!(must(log.get_findings_since(last_seq)).is_empty());

    let _ = fs::remove_file(&path);
}

#[test]
fn projection_is_identical_across_instances() {
    let path = temp_log("determinism");
    let mut writer = EventLog::new(&path);
    must(writer.append_event(&register("a1")));
    must(writer.append_event(&Event::TaskAdded(TaskAdded {
        description: "index files".to_string(),
        created_by: "a1".to_string(),
        priority: 1,
    })));
    // Completing an unclaimed task is rejected, not fatal.
    must(writer.append_event(&Event::TaskCompleted(TaskCompleted {
        task_id: "task-2".to_string(),
        agent_id: "a1".to_string(),
        result: None,
    })));
    must(writer.append_event(&Event::ContextSet(ContextSet {
        key: "branch".to_string(),
        value: json!("main"),
    })));

    let first = must(writer.get_current_state());
    let mut reader = EventLog::new(&path);
    let second = must(reader.get_current_state());
    assert_eq!(first, second);
    assert_eq!(must(reader.scan_report()).rejected, 1);

    let _ = fs::remove_file(&path);
}

#[test]
fn cache_follows_appends_from_other_instances() {
    let path = temp_log("cache");
    let mut left = EventLog::new(&path);
    let mut right = EventLog::new(&path);

    must(left.append_event(&finding("a1", "left-1")));
    assert_eq!(must(right.get_current_state()).findings.len(), 1);

    must(left.append_event(&finding("a1", "left-2")));
    assert_eq!(must(right.get_current_state()).findings.len(), 2);

    assert_eq!(must(right.append_event(&finding("a1", "right-1"))), 3);
    assert_eq!(must(left.append_event(&finding("a1", "left-3"))), 4);
    assert_eq!(must(left.read_events(2)).len(), 2);

    let _ = fs::remove_file(&path);
}

#[test]
fn concurrent_writers_never_reuse_sequence_numbers() {
    let path = temp_log("concurrent");
    let writers = 4;
    let per_writer = 25;

    let handles: Vec<_> = (0..writers)
        .map(|writer| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut log = EventLog::new(&path);
                let mut seqs = Vec::new();
                for index in 0..per_writer {
                    let event = finding(&format!("w{writer}"), &format!("{index}"));
                    match log.append_event(&event) {
                        Ok(seq) => seqs.push(seq),
                        Err(err) => panic!("append failed: {err:#}"),
                    }
                }
                seqs
            })
        })
        .collect();

    let mut all: Vec<u64> = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(seqs) => all.extend(seqs),
            Err(err) => panic!("writer thread failed: {err:?}"),
        }
    }
    all.sort_unstable();
    let expected: Vec<u64> = (1..=(writers * per_writer) as u64).collect();
    assert_eq!(all, expected);

    let mut reader = EventLog::new(&path);
    let stats = must(reader.get_stats());
    assert_eq!(stats.corrupt_records, 0);
    assert_eq!(stats.total_events, writers * per_writer);

    let _ = fs::remove_file(&path);
}

#[test]
fn missing_log_reads_as_empty() {
    let path = temp_log("missing");
    let mut log = EventLog::new(&path);
    let state = must(log.get_current_state());
    assert!(state.agents.is_empty());
    assert_eq!(must(log.get_stats()).total_events, 0);
    assert!(must(log.verify()).is_clean());
}
