use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ps_ingestion::presets;
use ps_ingestion::stages;
use ps_ingestion::store::{FileRunStore, MemoryRunStore, RunStore};
use ps_ingestion::{Format, PipelineRun, RunStatus, StageRegistry, build_orchestrator};
use serde_json::json;
use tempfile::tempdir;

async fn finished_run(format: Format) -> PipelineRun {
    let config = presets::preset("local").unwrap();
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    let orchestrator =
        build_orchestrator(&config, &registry, Arc::new(MemoryRunStore::new())).unwrap();
    orchestrator.execute(format, "manual").await.unwrap()
}

/// Rewrites the timestamps of `run` so it looks like it ran `days_ago`.
fn backdate(run: &PipelineRun, days_ago: i64) -> PipelineRun {
    let when = Utc.with_ymd_and_hms(2024, 6, 30, 22, 0, 0).single().unwrap()
        - chrono::Duration::days(days_ago);
    let mut value = serde_json::to_value(run).unwrap();
    value["started_at"] = json!(when);
    value["finished_at"] = json!(when + chrono::Duration::minutes(5));
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn file_store_round_trips_records() {
    let temp = tempdir().unwrap();
    let store = FileRunStore::open(temp.path().join("runs")).unwrap();
    let run = finished_run(Format::Ou).await;

    store.save(&run).unwrap();

    let path = store.directory().join(format!("{}.json", run.run_id()));
    assert!(path.is_file());
    assert!(!path.with_extension("json.tmp").exists());
    assert_eq!(store.load(run.run_id()).unwrap(), Some(run));
    assert_eq!(store.load(uuid::Uuid::new_v4()).unwrap(), None);
}

#[tokio::test]
async fn file_store_lists_newest_first_and_skips_garbage() {
    let temp = tempdir().unwrap();
    let store = FileRunStore::open(temp.path()).unwrap();
    let older = backdate(&finished_run(Format::Ou).await, 2);
    let newer = backdate(&finished_run(Format::Vgc).await, 1);
    store.save(&older).unwrap();
    store.save(&newer).unwrap();
    fs::write(temp.path().join("corrupt.json"), b"{not json").unwrap();

    let runs = store.list().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id(), newer.run_id());
    assert_eq!(runs[1].run_id(), older.run_id());
}

#[tokio::test]
async fn save_overwrites_the_previous_checkpoint() {
    let temp = tempdir().unwrap();
    let store = FileRunStore::open(temp.path()).unwrap();
    let pending = PipelineRun::new(Format::Ou, "ou-daily");
    store.save(&pending).unwrap();

    let mut value = serde_json::to_value(finished_run(Format::Ou).await).unwrap();
    value["run_id"] = json!(pending.run_id());
    let finished: PipelineRun = serde_json::from_value(value).unwrap();
    store.save(&finished).unwrap();

    let loaded = store.load(pending.run_id()).unwrap().unwrap();
    assert_eq!(loaded.status(), RunStatus::Succeeded);
    assert_eq!(store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn prune_removes_only_expired_terminal_records() {
    let temp = tempdir().unwrap();
    let store = FileRunStore::open(temp.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2024, 6, 30, 22, 0, 0).single().unwrap();

    let expired = backdate(&finished_run(Format::Ou).await, 10);
    let recent = backdate(&finished_run(Format::Vgc).await, 3);
    let running = PipelineRun::new(Format::Vgc, "vgc-daily");
    for run in [&expired, &recent, &running] {
        store.save(run).unwrap();
    }

    let removed = store
        .prune(Duration::from_secs(7 * 24 * 60 * 60), now)
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(store.load(expired.run_id()).unwrap(), None);
    assert!(store.load(recent.run_id()).unwrap().is_some());
    assert!(store.load(running.run_id()).unwrap().is_some());
}

#[test]
fn prune_removes_abandoned_running_records() {
    let temp = tempdir().unwrap();
    let store = FileRunStore::open(temp.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2024, 6, 30, 22, 0, 0).single().unwrap();

    let mut value = serde_json::to_value(PipelineRun::new(Format::Ou, "ou-daily")).unwrap();
    value["started_at"] = json!(now - chrono::Duration::days(9));
    let abandoned: PipelineRun = serde_json::from_value(value).unwrap();
    assert_eq!(abandoned.status(), RunStatus::Running);

    let mut value = serde_json::to_value(PipelineRun::new(Format::Vgc, "vgc-daily")).unwrap();
    value["started_at"] = json!(now - chrono::Duration::hours(1));
    let in_progress: PipelineRun = serde_json::from_value(value).unwrap();

    store.save(&abandoned).unwrap();
    store.save(&in_progress).unwrap();

    let removed = store
        .prune(Duration::from_secs(7 * 24 * 60 * 60), now)
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(store.load(abandoned.run_id()).unwrap(), None);
    assert!(store.load(in_progress.run_id()).unwrap().is_some());
}

#[test]
fn memory_store_keeps_latest_copy() {
    let store = MemoryRunStore::new();
    let first = PipelineRun::new(Format::Ou, "manual");
    let second = PipelineRun::new(Format::Vgc, "manual");
    store.save(&first).unwrap();
    store.save(&second).unwrap();
    store.save(&first).unwrap();

    assert_eq!(store.list().unwrap().len(), 2);
    assert_eq!(store.load(second.run_id()).unwrap(), Some(second));
}
