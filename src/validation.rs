use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::config::{AlertChannel, CONFIG_VERSION, IngestionConfig, StageConfig};
use crate::pipeline::StageRegistry;
use crate::retry::{Backoff, MAX_ATTEMPTS_CEILING};
use crate::stage::StageName;

/// Upper bound on a single stage call, matching the managed-function limit.
pub const MAX_STAGE_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &IngestionConfig, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != CONFIG_VERSION {
        report
            .errors
            .push(format!("Unsupported config version: {}", config.version));
    }

    if config.service.trim().is_empty() {
        report.errors.push("Service name cannot be empty".into());
    }

    let storage = &config.storage;
    for (label, value) in [
        ("replays_bucket", &storage.replays_bucket),
        ("teams_bucket", &storage.teams_bucket),
        ("teams_table", &storage.teams_table),
    ] {
        if value.trim().is_empty() {
            report.errors.push(format!("Storage '{label}' cannot be empty"));
        }
    }
    if !storage.replays_bucket.is_empty() && storage.replays_bucket == storage.teams_bucket {
        report.warnings.push(
            "Replays and teams share one bucket; raw and processed artifacts will interleave"
                .into(),
        );
    }

    if config.runs.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Run record directory cannot be empty".into());
    }
    if config.runs.retention_days == 0 {
        report.warnings.push(
            "Run record retention is 0 days; records may be pruned before diagnosis".into(),
        );
    }

    for stage in StageName::ORDER {
        report.merge(validate_stage(stage, config.stages.get(stage), config, registry));
    }

    report.merge(validate_triggers(config));
    report.merge(validate_alerts(config));

    report
}

fn validate_stage(
    stage: StageName,
    stage_config: &StageConfig,
    config: &IngestionConfig,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if stage_config.timeout_secs == 0 {
        report
            .errors
            .push(format!("Stage '{stage}' timeout must be greater than zero"));
    } else if stage_config.timeout_secs > MAX_STAGE_TIMEOUT_SECS {
        report.errors.push(format!(
            "Stage '{stage}' timeout {}s exceeds the {}s maximum",
            stage_config.timeout_secs, MAX_STAGE_TIMEOUT_SECS
        ));
    }

    let retry = &stage_config.retry;
    if retry.max_attempts == 0 {
        report
            .errors
            .push(format!("Stage '{stage}' retry max_attempts must be at least 1"));
    } else if retry.max_attempts > MAX_ATTEMPTS_CEILING {
        report.errors.push(format!(
            "Stage '{stage}' retry max_attempts {} exceeds the limit of {}",
            retry.max_attempts, MAX_ATTEMPTS_CEILING
        ));
    }
    if let Backoff::Exponential { base_ms, max_ms } = retry.backoff {
        if base_ms == 0 {
            report.warnings.push(format!(
                "Stage '{stage}' exponential backoff has a zero base; retries will not wait"
            ));
        }
        if max_ms < base_ms {
            report.errors.push(format!(
                "Stage '{stage}' backoff max_ms {max_ms} is below base_ms {base_ms}"
            ));
        }
    }

    if let Err(err) = registry.create(stage, stage_config, &config.storage) {
        report.errors.push(format!(
            "Stage '{stage}': {:#}",
            err.context("Failed to instantiate invoker")
        ));
    }

    report
}

fn validate_triggers(config: &IngestionConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.triggers.iter().all(|t| !t.enabled) {
        report
            .warnings
            .push("No enabled triggers; runs will only start manually".into());
    }

    let mut names = HashSet::new();
    let mut per_format: BTreeMap<_, Vec<&str>> = BTreeMap::new();
    for trigger in &config.triggers {
        if trigger.name.trim().is_empty() {
            report.errors.push("Trigger names cannot be empty".into());
        } else if !names.insert(trigger.name.as_str()) {
            report
                .errors
                .push(format!("Duplicate trigger name '{}'", trigger.name));
        }
        if trigger.hour > 23 {
            report.errors.push(format!(
                "Trigger '{}' hour {} is outside 0-23",
                trigger.name, trigger.hour
            ));
        }
        if trigger.minute > 59 {
            report.errors.push(format!(
                "Trigger '{}' minute {} is outside 0-59",
                trigger.name, trigger.minute
            ));
        }
        if trigger.enabled {
            per_format
                .entry(trigger.format)
                .or_default()
                .push(trigger.name.as_str());
        }
    }

    for (format, triggers) in per_format {
        if triggers.len() > 1 {
            report.warnings.push(format!(
                "Format {} has {} daily triggers ({}); runs for the same format may overlap",
                format,
                triggers.len(),
                triggers.join(", ")
            ));
        }
    }

    report
}

fn validate_alerts(config: &IngestionConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let alerts = &config.alerts;

    if alerts.recipient.trim().is_empty() {
        report
            .errors
            .push("Alert recipient cannot be empty".into());
    }
    if alerts.delivery_attempts == 0 {
        report
            .warnings
            .push("Alert delivery_attempts is 0; one attempt will be made".into());
    }
    match &alerts.channel {
        AlertChannel::Log => {}
        AlertChannel::Spool { path } => {
            if path.as_os_str().is_empty() {
                report.errors.push("Alert spool path cannot be empty".into());
            }
        }
        AlertChannel::Webhook { url } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                report
                    .errors
                    .push(format!("Alert webhook URL '{url}' must be http(s)"));
            }
        }
    }

    report
}
