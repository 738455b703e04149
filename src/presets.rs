use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{AlertChannel, Deployment, IngestionConfig, StageConfig, StagesConfig};
use crate::retry::RetryPolicy;

pub const PRESETS: [&str; 3] = ["local", "dev", "prod"];

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = preset(name)?;

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset config: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

pub fn preset(name: &str) -> Result<IngestionConfig> {
    match name {
        "local" => Ok(local_preset()),
        "dev" => Ok(dev_preset()),
        "prod" => Ok(prod_preset()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

/// Simulated stages and log alerts: runs end to end without external tools.
fn local_preset() -> IngestionConfig {
    let mut config = IngestionConfig::defaults_for(Deployment::Dev);
    let quick_retry = RetryPolicy::fixed(3, Duration::from_secs(1));
    config.stages = StagesConfig {
        extract: simulated(quick_retry.clone()),
        transform: simulated(quick_retry.clone()),
        load: simulated(quick_retry),
    };
    config.alerts.channel = AlertChannel::Log;
    config
}

fn dev_preset() -> IngestionConfig {
    let mut config = IngestionConfig::defaults_for(Deployment::Dev);
    config.alerts.channel = AlertChannel::Spool {
        path: PathBuf::from("./var/alerts/ps-ingestion-dev.jsonl"),
    };
    config
}

fn prod_preset() -> IngestionConfig {
    let mut config = IngestionConfig::defaults_for(Deployment::Prod);
    config.runs.directory = PathBuf::from("/var/lib/ps-ingestion/runs");
    config.alerts.channel = AlertChannel::Webhook {
        url: "https://alerts.example.com/hooks/ps-ingestion".into(),
    };
    config
}

fn simulated(retry: RetryPolicy) -> StageConfig {
    StageConfig {
        retry,
        ..StageConfig::simulated()
    }
}
