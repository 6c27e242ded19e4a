//! CLI integration tests for docstore-migrate.
//!
//! These tests verify argument parsing, exit codes, and end-to-end runs
//! against a JSON snapshot in a temporary directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the docstore-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("docstore-migrate").unwrap()
}

/// Write a snapshot with three users (two still on `old`) and an order under u1.
fn fixture(dir: &TempDir, plan: &str) -> (PathBuf, PathBuf) {
    let snapshot = dir.path().join("snapshot.json");
    fs::write(
        &snapshot,
        r#"{
  "users": {
    "u1": {"old": "a"},
    "u2": {"old": "b"},
    "u3": {"new": "c"}
  },
  "users/u1/orders": {
    "o1": {"total": 5}
  }
}"#,
    )
    .unwrap();

    let config = dir.path().join("config.yaml");
    fs::write(
        &config,
        format!(
            "store:\n  path: {}\nmigration:\n  retry_base_delay_ms: 1\n{}",
            snapshot.display(),
            plan
        ),
    )
    .unwrap();
    (config, snapshot)
}

const RENAME_PLAN: &str = r#"plan:
  name: rename-old
  collection: users
  ops:
    - rename_field: { from: old, to: new }
"#;

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("delete-tree"))
        .stdout(predicate::str::contains("delete-docs"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--collection"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("docstore-migrate"));
}

#[test]
fn test_shutdown_timeout_default() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"));
}

// =============================================================================
// Error Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_fails() {
    cmd()
        .args(["-c", "/nonexistent/config.yaml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "plan: [not, a, plan").unwrap();

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2);
}

#[test]
fn test_invalid_plan_exit_code() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(
        &dir,
        "plan:\n  name: empty\n  collection: users\n  ops: []\n",
    );

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_batch_size_over_store_cap_rejected() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir, RENAME_PLAN);
    let yaml = fs::read_to_string(&config)
        .unwrap()
        .replace("migration:\n", "migration:\n  max_batch_size: 900\n");
    fs::write(&config, yaml).unwrap();

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2);
}

#[test]
fn test_resume_requires_state_file() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir, RENAME_PLAN);

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("resume")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--state-file is required"));
}

// =============================================================================
// End-to-end Tests
// =============================================================================

#[test]
fn test_validate_prints_plan() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir, RENAME_PLAN);

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("rename-old"))
        .stdout(predicate::str::contains("Collection: users"));
}

#[test]
fn test_run_outputs_json_and_saves_snapshot() {
    let dir = TempDir::new().unwrap();
    let (config, snapshot) = fixture(&dir, RENAME_PLAN);

    let output = cmd()
        .arg("-c")
        .arg(&config)
        .args(["--output-json", "run"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["scanned"], 3);
    assert_eq!(result["updated"], 2);
    assert_eq!(result["skipped"], 1);
    assert_eq!(result["commits"], 1);

    let saved = read_json(&snapshot);
    assert_eq!(saved["users"]["u1"]["new"], "a");
    assert!(saved["users"]["u1"].get("old").is_none());
    assert_eq!(saved["users"]["u3"]["new"], "c");
    assert_eq!(saved["users/u1/orders"]["o1"]["total"], 5);
}

#[test]
fn test_failed_run_exits_non_zero_with_result() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(
        &dir,
        r#"plan:
  name: archive
  collection: users
  ops:
    - set_field: { field: archived, value: true, target: "archive/{id}" }
"#,
    );

    let output = cmd()
        .arg("-c")
        .arg(&config)
        .args(["--output-json", "run"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let result: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["status"], "failed");
    assert!(result["fatal_error"]
        .as_str()
        .unwrap()
        .contains("Document not found"));
}

#[test]
fn test_dry_run_leaves_snapshot_untouched() {
    let dir = TempDir::new().unwrap();
    let (config, snapshot) = fixture(&dir, RENAME_PLAN);
    let before = fs::read_to_string(&snapshot).unwrap();

    cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dry run"));

    assert_eq!(fs::read_to_string(&snapshot).unwrap(), before);
}

#[test]
fn test_run_writes_state_file() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir, RENAME_PLAN);
    let state = dir.path().join("state.json");

    cmd()
        .arg("-c")
        .arg(&config)
        .arg("--state-file")
        .arg(&state)
        .arg("run")
        .assert()
        .success();

    let saved = read_json(&state);
    assert_eq!(saved["status"], "completed");
    assert!(saved["hmac"].is_string());
}

#[test]
fn test_delete_tree_removes_subcollections() {
    let dir = TempDir::new().unwrap();
    let (config, snapshot) = fixture(&dir, RENAME_PLAN);

    cmd()
        .arg("-c")
        .arg(&config)
        .args(["delete-tree", "users/u1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 2 documents"));

    let saved = read_json(&snapshot);
    assert!(saved["users"].get("u1").is_none());
    assert!(saved.get("users/u1/orders").is_none());
    assert_eq!(saved["users"]["u2"]["old"], "b");
}

#[test]
fn test_delete_tree_dry_run_counts_only() {
    let dir = TempDir::new().unwrap();
    let (config, snapshot) = fixture(&dir, RENAME_PLAN);
    let before = fs::read_to_string(&snapshot).unwrap();

    cmd()
        .arg("-c")
        .arg(&config)
        .args(["delete-tree", "users/u1", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would delete 2 documents"));

    assert_eq!(fs::read_to_string(&snapshot).unwrap(), before);
}

#[test]
fn test_delete_docs_json_report() {
    let dir = TempDir::new().unwrap();
    let (config, snapshot) = fixture(&dir, RENAME_PLAN);

    let output = cmd()
        .arg("-c")
        .arg(&config)
        .args(["--output-json", "delete-docs", "users/u2", "users/ghost"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["documents_deleted"], 2);
    assert_eq!(report["cancelled"], false);

    let saved = read_json(&snapshot);
    assert!(saved["users"].get("u2").is_none());
    assert_eq!(saved["users"]["u1"]["old"], "a");
}

#[test]
fn test_bad_document_path_rejected() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir, RENAME_PLAN);

    cmd()
        .arg("-c")
        .arg(&config)
        .args(["delete-tree", "users"])
        .assert()
        .failure();
}
