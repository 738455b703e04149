use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::format::Format;
use crate::retry::RetryPolicy;
use crate::scheduler::TriggerSpec;
use crate::stage::StageName;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Dev,
    Prod,
}

impl Deployment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deployment::Dev => "dev",
            Deployment::Prod => "prod",
        }
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub version: u32,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub deployment: Deployment,
    pub storage: StorageConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    pub stages: StagesConfig,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerSpec>,
    pub alerts: AlertConfig,
}

impl IngestionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: IngestionConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Configuration mirroring the deployed stack for `deployment`, with every
    /// stage backed by an external command.
    pub fn defaults_for(deployment: Deployment) -> Self {
        Self {
            version: CONFIG_VERSION,
            service: default_service(),
            deployment,
            storage: StorageConfig::for_deployment(deployment),
            runs: RunsConfig::default(),
            stages: StagesConfig {
                extract: StageConfig::command(&["ps-replay-extraction"]),
                transform: StageConfig::command(&["ps-replay-transform"]),
                load: StageConfig::command(&["ps-teams-ddb-writer"]),
            },
            triggers: default_triggers(),
            alerts: AlertConfig::default(),
        }
    }

    /// Name alerts and logs are tagged with, e.g. `PsIngestionService-prod`.
    pub fn qualified_service(&self) -> String {
        format!("{}-{}", self.service, self.deployment)
    }
}

fn default_service() -> String {
    "PsIngestionService".to_string()
}

pub fn default_triggers() -> Vec<TriggerSpec> {
    vec![
        TriggerSpec::daily("ou-daily", Format::Ou, 22, 0),
        TriggerSpec::daily("vgc-daily", Format::Vgc, 22, 15),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Raw replays written by extract, read by transform.
    pub replays_bucket: String,
    /// Team documents written by transform, read by load.
    pub teams_bucket: String,
    /// Final records written by load.
    pub teams_table: String,
}

impl StorageConfig {
    pub fn for_deployment(deployment: Deployment) -> Self {
        Self {
            replays_bucket: format!("ps-ingestion-replays-{deployment}"),
            teams_bucket: format!("ps-ingestion-teams-{deployment}"),
            teams_table: format!("PsIngestionTeams-{deployment}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunsConfig {
    #[serde(default = "default_runs_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            directory: default_runs_directory(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl RunsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

fn default_runs_directory() -> PathBuf {
    PathBuf::from("./var/runs")
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    pub extract: StageConfig,
    pub transform: StageConfig,
    pub load: StageConfig,
}

impl StagesConfig {
    pub fn get(&self, stage: StageName) -> &StageConfig {
        match stage {
            StageName::Extract => &self.extract,
            StageName::Transform => &self.transform,
            StageName::Load => &self.load,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_invoker")]
    pub invoker: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StageConfig {
    pub fn command(argv: &[&str]) -> Self {
        Self {
            invoker: default_invoker(),
            command: argv.iter().map(|arg| (*arg).to_string()).collect(),
            timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn simulated() -> Self {
        Self {
            invoker: "simulate".to_string(),
            command: Vec::new(),
            timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_invoker() -> String {
    "command".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub recipient: String,
    #[serde(default)]
    pub channel: AlertChannel,
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
    #[serde(default = "default_delivery_delay_ms")]
    pub delivery_delay_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            recipient: "ingestion-alerts@example.com".to_string(),
            channel: AlertChannel::default(),
            delivery_attempts: default_delivery_attempts(),
            delivery_delay_ms: default_delivery_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertChannel {
    #[default]
    Log,
    Spool {
        path: PathBuf,
    },
    Webhook {
        url: String,
    },
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_delivery_delay_ms() -> u64 {
    500
}
