//! CLI integration tests for the `gatekeeper` binary.
//!
//! Each test works in its own temporary repository with a small JSON
//! configuration whose gates are plain shell checks, so no toolchain or
//! network access is needed.

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

/// Get a Command for the gatekeeper binary
fn gatekeeper() -> Command {
    Command::new(cargo::cargo_bin!("gatekeeper"))
}

/// Write `.gatekeeper/config.json` with one gate and a shell agent.
fn write_config(dir: &Path, gate_command: &str, agent_script: &str) {
    let config = json!({
        "version": 1,
        "maxRetries": 3,
        "qaGates": [
            { "name": "check", "command": gate_command, "timeoutSecs": 10 }
        ],
        "agent": {
            "command": "sh",
            "args": ["-c", agent_script],
            "timeoutSecs": 10
        }
    });
    let config_dir = dir.join(".gatekeeper");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
}

/// Last JSON line printed to stdout.
fn last_json(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .expect("no output");
    serde_json::from_str(line).expect("stdout line is not JSON")
}

/// Create a plan through the CLI and return `(plan_id, task_ids)`.
fn create_plan(dir: &Path, extra: &[&str]) -> (String, Vec<String>) {
    let output = gatekeeper()
        .arg("--repo")
        .arg(dir)
        .args(["plan", "create", "--title", "Ship it", "--task", "first", "--task", "second"])
        .args(extra)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let created = last_json(&output.stdout);
    let plan_id = created["planId"].as_str().unwrap().to_string();
    let task_ids = created["taskIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    (plan_id, task_ids)
}

// ============================================================
// Basic commands
// ============================================================

#[test]
fn test_cli_help_lists_subcommands() {
    gatekeeper()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("gates"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_cli_config_prints_defaults() {
    let temp = TempDir::new().unwrap();

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("config")
        .output()
        .unwrap();
    assert!(output.status.success());

    let config = last_json(&output.stdout);
    assert_eq!(config["version"], 1);
    assert_eq!(config["maxRetries"], 3);
    assert_eq!(config["qaGates"].as_array().unwrap().len(), 3);
}

#[test]
fn test_cli_invalid_config_fails_fast() {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join(".gatekeeper");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.json"),
        r#"{"version": 1, "maxRetries": 0, "qaGates": [{"name": "x", "command": "true"}]}"#,
    )
    .unwrap();

    gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("config")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("maxRetries"));
}

#[test]
fn test_cli_missing_repo_is_request_error() {
    gatekeeper()
        .args(["--repo", "/definitely/not/a/real/path", "config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_cli_gates_pass_and_fail() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "true", "true");

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("gates")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(last_json(&output.stdout)["allPassed"], true);

    write_config(temp.path(), "echo 'src/lib.rs:1: broken' >&2; exit 1", "true");
    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("gates")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let suite = last_json(&output.stdout);
    assert_eq!(suite["allPassed"], false);
    assert!(suite["results"][0]["output"]
        .as_str()
        .unwrap()
        .contains("broken"));
}

// ============================================================
// Retry loop
// ============================================================

#[test]
fn test_cli_run_fixes_then_passes() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "test -f fixed.txt", "cat >/dev/null; touch fixed.txt");
    let (plan_id, tasks) = create_plan(temp.path(), &[]);

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", &tasks[0]])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let response = last_json(&output.stdout);
    assert_eq!(response["status"], "completed");
    assert_eq!(response["result"]["passed"], true);
    assert_eq!(response["result"]["attempt"], 2);
    assert!(temp.path().join("fixed.txt").exists());

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["status", &tasks[0]])
        .output()
        .unwrap();
    let status = last_json(&output.stdout);
    assert_eq!(status["task"]["status"], "completed");
    assert_eq!(status["plan"]["id"], plan_id.as_str());
    assert_eq!(status["plan"]["status"], "running");
    assert_eq!(status["plan"]["currentTaskId"], tasks[1].as_str());
}

#[test]
fn test_cli_run_exhausts_budget() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "exit 1", "cat >/dev/null");
    let (_, tasks) = create_plan(temp.path(), &["--max-attempts", "2"]);

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", &tasks[0]])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let response = last_json(&output.stdout);
    assert_eq!(response["result"]["passed"], false);
    assert_eq!(response["result"]["attempt"], 2);
    assert_eq!(response["result"]["outcome"], "max_retries_reached");

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["status", &tasks[0]])
        .output()
        .unwrap();
    let status = last_json(&output.stdout);
    assert_eq!(status["task"]["status"], "failed");
    assert_eq!(status["plan"]["status"], "failed");
    assert_eq!(status["plan"]["currentTaskId"], tasks[0].as_str());
}

#[test]
fn test_cli_run_unknown_task_is_not_found() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "true", "true");

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", "no-such-task"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(last_json(&output.stdout)["status"], "not_found");
}

#[test]
fn test_cli_rerun_completed_task_conflicts() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "true", "true");
    let (_, tasks) = create_plan(temp.path(), &[]);

    gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", &tasks[0]])
        .assert()
        .success();

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", &tasks[0]])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(last_json(&output.stdout)["status"], "conflict");
}

#[test]
fn test_cli_run_detached_streams_events() {
    let temp = TempDir::new().unwrap();
    write_config(temp.path(), "test -f fixed.txt", "cat >/dev/null; touch fixed.txt");
    let (_, tasks) = create_plan(temp.path(), &[]);

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["run", "--detach", &tasks[0]])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines.first().unwrap()["status"], "accepted");
    let kinds: Vec<&str> = lines
        .iter()
        .filter_map(|l| l["event"]["type"].as_str())
        .collect();
    assert_eq!(kinds.first(), Some(&"loop_started"));
    assert!(kinds.contains(&"fix_requested"));
    assert_eq!(kinds.last(), Some(&"loop_passed"));
    assert!(lines
        .iter()
        .filter(|l| l.get("event").is_some())
        .all(|l| l["schemaVersion"] == 1));

    let last = lines.last().unwrap();
    assert_eq!(last["status"], "completed");
    assert_eq!(last["result"]["attempt"], 2);
}

// ============================================================
// Plans and reconciliation
// ============================================================

#[test]
fn test_cli_reconcile_empty_store() {
    let temp = TempDir::new().unwrap();

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("reconcile")
        .output()
        .unwrap();
    assert!(output.status.success());

    let response = last_json(&output.stdout);
    assert_eq!(response["status"], "reconciled");
    assert_eq!(response["report"]["checked"], 0);
}

#[test]
fn test_cli_reconcile_repairs_then_resume() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join(".gatekeeper");
    std::fs::create_dir_all(&state_dir).unwrap();

    let now = "2026-01-15T10:00:00Z";
    let state = json!({
        "plans": [{
            "id": "p1",
            "title": "Stuck",
            "status": "failed",
            "currentTaskId": "t1",
            "createdAt": now,
            "updatedAt": now
        }],
        "tasks": [{
            "id": "t1",
            "planId": "p1",
            "title": "done already",
            "status": "completed",
            "attempt": 1,
            "createdAt": now,
            "updatedAt": now
        }]
    });
    std::fs::write(
        state_dir.join("state.json"),
        serde_json::to_string_pretty(&state).unwrap(),
    )
    .unwrap();

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("reconcile")
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = &last_json(&output.stdout)["report"];
    assert_eq!(report["checked"], 1);
    assert_eq!(report["fixed"], 1);
    assert_eq!(
        report["results"][0]["reason"],
        "Current task completed but plan was failed"
    );
    assert_eq!(report["results"][0]["newStatus"], "paused");

    // A second pass finds nothing to do.
    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .arg("reconcile")
        .output()
        .unwrap();
    assert_eq!(last_json(&output.stdout)["report"]["fixed"], 0);

    gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["plan", "resume", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"pending\""));

    // Resuming again conflicts: the plan is no longer paused.
    gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["plan", "resume", "p1"])
        .assert()
        .code(2);
}

#[test]
fn test_cli_plan_list_newest_first() {
    let temp = TempDir::new().unwrap();
    let (first, _) = create_plan(temp.path(), &[]);
    let (second, _) = create_plan(temp.path(), &[]);

    let output = gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["plan", "list"])
        .output()
        .unwrap();
    let plans = last_json(&output.stdout);
    let ids: Vec<&str> = plans
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);
}

#[test]
fn test_cli_status_unknown_task() {
    let temp = TempDir::new().unwrap();

    gatekeeper()
        .arg("--repo")
        .arg(temp.path())
        .args(["status", "ghost"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not_found"));
}
