//! CLI surface smoke tests: subcommands, output, and exit codes.

use assert_cmd::Command;
use tempfile::TempDir;

fn armitage(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("armitage").expect("binary");
    cmd.current_dir(dir.path())
        .env("ARMITAGE_DB_PATH", dir.path().join("state.db"));
    cmd
}

#[test]
fn init_creates_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir)
        .args(["init"])
        .assert()
        .success()
        .stdout(predicates::str::contains("initialized state database"));
    assert!(dir.path().join("state.db").exists());
}

#[test]
fn status_on_empty_store_reports_no_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("tasks:"))
        .stdout(predicates::str::contains("circuits:"));
}

#[test]
fn ingest_then_status_counts_pending_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tasks = serde_json::json!([
        {"task_key": "T1", "title": "first task"},
        {"task_key": "T2", "title": "second task", "depends_on": ["T1"]}
    ]);
    let tasks_path = dir.path().join("tasks.json");
    std::fs::write(&tasks_path, tasks.to_string()).expect("write");

    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .arg("ingest")
        .arg(&tasks_path)
        .assert()
        .success()
        .stdout(predicates::str::contains("ingested 2 task(s)"));

    // Re-ingesting skips duplicates instead of failing.
    armitage(&dir)
        .arg("ingest")
        .arg(&tasks_path)
        .assert()
        .success()
        .stdout(predicates::str::contains("skipped 2 duplicate(s)"));

    armitage(&dir)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("pending: 2"));
}

#[test]
fn retry_unknown_task_is_an_operational_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .args(["retry", "NOPE"])
        .assert()
        .code(1)
        .stderr(predicates::str::contains("not found"));
}

#[test]
fn circuits_reset_rejects_malformed_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .args(["circuits", "reset", "malformed"])
        .assert()
        .code(2)
        .stderr(predicates::str::contains("configuration error"));
}

#[test]
fn circuits_reset_creates_and_closes_breaker() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .args(["circuits", "reset", "system:system"])
        .assert()
        .success()
        .stdout(predicates::str::contains("state=closed"));
    armitage(&dir)
        .args(["circuits", "health"])
        .assert()
        .success()
        .stdout(predicates::str::contains("system: 0 open / 1 total"));
}

#[test]
fn ingest_missing_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    armitage(&dir).args(["init"]).assert().success();
    armitage(&dir)
        .args(["ingest", "does-not-exist.json"])
        .assert()
        .code(2)
        .stderr(predicates::str::contains("configuration error"));
}
