use std::process::{Output, Stdio};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

use crate::config::StorageConfig;
use crate::pipeline::StageRegistry;
use crate::stage::{ArtifactRef, StageError, StageInput, StageInvoker, StageName};

/// `EX_TEMPFAIL` from sysexits.h: the stage asks to be retried.
pub const EXIT_TEMPFAIL: i32 = 75;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("command", |_stage, config, storage| {
        Ok(Arc::new(CommandInvoker::new(&config.command, storage)?))
    });
    registry.register("simulate", |_stage, _config, storage| {
        Ok(Arc::new(SimulatedInvoker::new(storage.clone())))
    });
}

/// Runs an external program for every invocation.
///
/// The stage input is appended as the last argument and exported as
/// `PS_INGESTION_INPUT`. On success the last non-empty stdout line is the
/// produced artifact reference.
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    env: Vec<(&'static str, String)>,
}

impl CommandInvoker {
    pub fn new(argv: &[String], storage: &StorageConfig) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("command invoker requires a non-empty 'command'");
        };
        if program.trim().is_empty() {
            bail!("command invoker program cannot be blank");
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: vec![
                ("REPLAYS_BUCKET_NAME", storage.replays_bucket.clone()),
                ("TEAMS_BUCKET_NAME", storage.teams_bucket.clone()),
                ("TABLE_NAME", storage.teams_table.clone()),
            ],
        })
    }
}

#[async_trait]
impl StageInvoker for CommandInvoker {
    async fn invoke(&self, stage: StageName, input: &StageInput) -> Result<ArtifactRef, StageError> {
        debug!(program = self.program.as_str(), stage = %stage, input = %input, "Spawning stage command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(input.as_str())
            .env("PS_INGESTION_STAGE", stage.as_str())
            .env("PS_INGESTION_INPUT", input.as_str())
            .envs(self.env.iter().map(|(key, value)| (*key, value.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                StageError::permanent(format!("failed to launch '{}': {err}", self.program))
            })?;
        classify_output(&self.program, &output)
    }
}

fn classify_output(program: &str, output: &Output) -> Result<ArtifactRef, StageError> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!(program, stderr = %stderr.trim_end(), "Stage command stderr");
    }
    match output.status.code() {
        Some(0) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            last_line(&stdout).map(ArtifactRef::new).ok_or_else(|| {
                StageError::permanent(format!(
                    "'{program}' exited successfully without printing an artifact reference"
                ))
            })
        }
        Some(EXIT_TEMPFAIL) => Err(StageError::transient(
            last_line(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("'{program}' reported a temporary failure")),
        )),
        Some(code) => Err(StageError::permanent(
            last_line(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("'{program}' exited with status {code}")),
        )),
        None => Err(StageError::transient(format!(
            "'{program}' was terminated by a signal"
        ))),
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// Performs no work and answers with format-namespaced locations in the
/// configured storage. Used for dry runs and local smoke tests.
pub struct SimulatedInvoker {
    storage: StorageConfig,
}

impl SimulatedInvoker {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StageInvoker for SimulatedInvoker {
    async fn invoke(&self, stage: StageName, input: &StageInput) -> Result<ArtifactRef, StageError> {
        match (stage, input) {
            (StageName::Extract, StageInput::Format(format)) => Ok(ArtifactRef::new(format!(
                "s3://{}/{}/{}.json",
                self.storage.replays_bucket,
                format.slug(),
                Utc::now().format("%Y-%m-%d")
            ))),
            (StageName::Transform, StageInput::Artifact(artifact)) => {
                let key = object_key(artifact)?;
                Ok(ArtifactRef::new(format!(
                    "s3://{}/{}",
                    self.storage.teams_bucket, key
                )))
            }
            (StageName::Load, StageInput::Artifact(artifact)) => {
                let key = object_key(artifact)?;
                let item = key.strip_suffix(".json").unwrap_or(key);
                Ok(ArtifactRef::new(format!(
                    "dynamodb://{}/{}",
                    self.storage.teams_table, item
                )))
            }
            (stage, input) => Err(StageError::permanent(format!(
                "{stage} cannot accept input '{input}'"
            ))),
        }
    }
}

fn object_key(artifact: &ArtifactRef) -> Result<&str, StageError> {
    artifact
        .as_str()
        .strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, key)| key)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            StageError::permanent(format!("'{artifact}' is not an object-storage reference"))
        })
}

#[cfg(test)]
mod tests {
    use super::{last_line, object_key};
    use crate::stage::ArtifactRef;

    #[test]
    fn last_line_skips_trailing_blanks() {
        assert_eq!(last_line("a\nb\n\n  \n"), Some("b"));
        assert_eq!(last_line("\n\n"), None);
    }

    #[test]
    fn object_key_requires_bucket_and_key() {
        let artifact = ArtifactRef::new("s3://raw/ou/2024-01-01.json");
        assert_eq!(object_key(&artifact).unwrap(), "ou/2024-01-01.json");
        assert!(object_key(&ArtifactRef::new("s3://raw/")).is_err());
        assert!(object_key(&ArtifactRef::new("file:///tmp/x")).is_err());
    }
}
