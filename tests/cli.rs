use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn ps_ingestion(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ps-ingestion").expect("binary present");
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

fn write_local_config(dir: &Path) {
    ps_ingestion(dir)
        .args(["config", "new", "--preset", "local"])
        .assert()
        .success();
    assert!(dir.join("config/local.yaml").is_file());
}

#[test]
fn config_new_then_validate() {
    let temp = tempdir().unwrap();
    write_local_config(temp.path());

    ps_ingestion(temp.path())
        .args(["validate", "config/local.yaml"])
        .assert()
        .success();
}

#[test]
fn validate_rejects_broken_config() {
    let temp = tempdir().unwrap();
    write_local_config(temp.path());
    let path = temp.path().join("config/local.yaml");
    let contents = fs::read_to_string(&path)
        .unwrap()
        .replace("hour: 22", "hour: 25");
    fs::write(&path, contents).unwrap();

    ps_ingestion(temp.path())
        .args(["validate", "config/local.yaml"])
        .assert()
        .failure();
}

#[test]
fn run_succeeds_and_persists_record() {
    let temp = tempdir().unwrap();
    write_local_config(temp.path());

    let output = ps_ingestion(temp.path())
        .args(["run", "config/local.yaml", "--format", "ou"])
        .args(["--metrics-json", "out/metrics.json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let run: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["format"], "OU");
    assert_eq!(run["artifact_refs"].as_array().unwrap().len(), 3);

    let run_id = run["run_id"].as_str().unwrap();
    assert!(temp.path().join(format!("var/runs/{run_id}.json")).is_file());
    assert!(temp.path().join("out/metrics.json").is_file());

    let status = ps_ingestion(temp.path())
        .args(["status", "config/local.yaml", run_id])
        .output()
        .unwrap();
    assert!(status.status.success());
    let stored: Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(stored["run_id"], run_id);

    ps_ingestion(temp.path())
        .args(["runs", "config/local.yaml"])
        .assert()
        .success()
        .stdout(predicates::str::contains(run_id));
}

#[cfg(unix)]
#[test]
fn failed_run_exits_nonzero_and_spools_alert() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("failing.yaml"),
        r#"version: 1
storage:
  replays_bucket: replays
  teams_bucket: teams
  teams_table: Teams
stages:
  extract:
    command: ["sh", "-c", "echo 'invalid format' >&2; exit 1"]
  transform:
    invoker: simulate
  load:
    invoker: simulate
alerts:
  recipient: oncall@example.com
  channel:
    kind: spool
    path: alerts/spool.jsonl
  delivery_delay_ms: 0
"#,
    )
    .unwrap();

    let output = ps_ingestion(temp.path())
        .args(["run", "failing.yaml", "--format", "VGC"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let run: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(run["status"], "failed");
    assert_eq!(run["current_stage"], "extract");
    assert_eq!(run["stage_attempts"]["extract"], 1);
    assert_eq!(run["failure"]["error"]["message"], "invalid format");

    let spool = fs::read_to_string(temp.path().join("alerts/spool.jsonl")).unwrap();
    assert_eq!(spool.lines().count(), 1);
    assert!(spool.contains("invalid format"));
}

#[test]
fn triggers_lists_both_daily_schedules() {
    let temp = tempdir().unwrap();
    write_local_config(temp.path());

    ps_ingestion(temp.path())
        .args(["triggers", "config/local.yaml"])
        .assert()
        .success()
        .stdout(predicates::str::contains("cron(0 22 * * ? *)"))
        .stdout(predicates::str::contains("cron(15 22 * * ? *)"));
}

#[test]
fn list_invokers_shows_builtin_kinds() {
    let temp = tempdir().unwrap();
    ps_ingestion(temp.path())
        .arg("list-invokers")
        .assert()
        .success()
        .stdout(predicates::str::contains("command"))
        .stdout(predicates::str::contains("simulate"));
}
