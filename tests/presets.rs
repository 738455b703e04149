use std::fs;

use ps_ingestion::config::{AlertChannel, Deployment};
use ps_ingestion::presets::{generate_preset, preset};
use ps_ingestion::{Format, IngestionConfig};
use tempfile::tempdir;

#[test]
fn generate_local_preset_writes_loadable_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config").join("local.yaml");
    let generated = generate_preset("local", &path).expect("preset generation");
    assert!(generated.exists());

    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("invoker: simulate"));
    assert!(contents.contains("name: ou-daily"));
    assert!(contents.contains("name: vgc-daily"));

    let config = IngestionConfig::load(&generated).expect("load preset");
    assert_eq!(config.deployment, Deployment::Dev);
    assert_eq!(config.triggers.len(), 2);
    assert_eq!(config.triggers[1].format, Format::Vgc);
    assert_eq!(config.stages.extract.retry.max_attempts, 3);
}

#[test]
fn dev_preset_spools_alerts_and_runs_commands() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("dev.yaml");
    generate_preset("dev", &path).unwrap();

    let config = IngestionConfig::load(&path).unwrap();
    assert_eq!(config.stages.extract.invoker, "command");
    assert_eq!(config.stages.load.command, vec!["ps-teams-ddb-writer".to_string()]);
    assert!(matches!(config.alerts.channel, AlertChannel::Spool { .. }));
    assert_eq!(config.storage.replays_bucket, "ps-ingestion-replays-dev");
}

#[test]
fn prod_preset_targets_prod_resources() {
    let config = preset("prod").unwrap();
    assert_eq!(config.deployment, Deployment::Prod);
    assert_eq!(config.storage.teams_table, "PsIngestionTeams-prod");
    assert_eq!(config.qualified_service(), "PsIngestionService-prod");
    assert!(matches!(config.alerts.channel, AlertChannel::Webhook { .. }));
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("staging", &temp.path().join("staging.yaml")).unwrap_err();
    assert!(err.to_string().contains("Unknown preset 'staging'"));
    assert!(!temp.path().join("staging.yaml").exists());
}

#[test]
fn minimal_yaml_fills_in_defaults() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("minimal.yaml");
    fs::write(
        &path,
        r#"version: 1
storage:
  replays_bucket: replays
  teams_bucket: teams
  teams_table: Teams
stages:
  extract:
    command: [extract-replays]
  transform:
    invoker: simulate
  load:
    invoker: simulate
    timeout_secs: 60
    retry:
      max_attempts: 5
      backoff:
        strategy: fixed
        delay_ms: 250
alerts:
  recipient: oncall@example.com
"#,
    )
    .unwrap();

    let config = IngestionConfig::load(&path).unwrap();
    assert_eq!(config.service, "PsIngestionService");
    assert_eq!(config.triggers.len(), 2);
    assert_eq!(config.runs.retention_days, 7);
    assert_eq!(config.stages.extract.invoker, "command");
    assert_eq!(config.stages.extract.timeout_secs, 300);
    assert_eq!(config.stages.load.retry.max_attempts, 5);
    assert_eq!(config.alerts.channel, AlertChannel::Log);
    assert_eq!(config.alerts.delivery_attempts, 3);
}
