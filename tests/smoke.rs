//! Smoke tests -- verify the binary runs and key subcommands work.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn evalrunner() -> Command {
    let mut cmd = Command::cargo_bin("evalrunner").unwrap();
    cmd.env_remove("EVALRUNNER_CONFIG").env("RUST_LOG", "warn");
    cmd
}

/// Config pointing the store at a scratch database.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("evalrunner.toml");
    let db = dir.join("results.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\n\n[evaluation]\nbase_url = \"http://127.0.0.1:9\"\ntimeout_secs = 1\n",
            db.to_string_lossy()
        ),
    )
    .unwrap();
    path
}

const SUITE: &str = r#"{
  "name": "cli-smoke",
  "default_adapter": {"type": "mock", "config": {"actual_output": "Paris"}},
  "test_cases": [
    {"id": "tc_001", "input": "What is the capital of France?"},
    {"id": "tc_002", "input": "What is the capital of Spain?",
     "adapter": {"type": "mock", "config": {"error": "upstream 503"}}}
  ]
}"#;

#[test]
fn test_cli_help() {
    evalrunner()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("LLM evaluation suites"));
}

#[test]
fn test_cli_version() {
    evalrunner()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("evalrunner"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["run", "--help"],
        vec!["serve", "--help"],
        vec!["runs", "list", "--help"],
        vec!["history", "--help"],
        vec!["export", "--help"],
    ] {
        evalrunner().args(&args).assert().success();
    }
}

#[test]
fn test_adapters_lists_builtins() {
    evalrunner()
        .arg("adapters")
        .assert()
        .success()
        .stdout(predicate::str::contains("mock").and(predicate::str::contains("shell")));
}

#[test]
fn test_run_suite_reports_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let suite = dir.path().join("smoke.json");
    std::fs::write(&suite, SUITE).unwrap();

    // One passing and one errored case: the run completes but exits non-zero.
    evalrunner()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&suite)
        .assert()
        .failure()
        .stdout(predicate::str::contains("passed: 1").and(predicate::str::contains("upstream 503")));

    evalrunner()
        .arg("--config")
        .arg(&config)
        .args(["run", "--only", "tc_001", "--json"])
        .arg(&suite)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"skipped\": 1"));

    evalrunner()
        .arg("--config")
        .arg(&config)
        .args(["runs", "list", "--suite", "cli-smoke"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cli-smoke"));

    evalrunner()
        .arg("--config")
        .arg(&config)
        .args(["history", "tc_001", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"actual_output\": \"Paris\""));
}

#[test]
fn test_run_missing_suite_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    evalrunner()
        .arg("--config")
        .arg(&config)
        .args(["run", "does-not-exist.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does-not-exist.toml"));
}
