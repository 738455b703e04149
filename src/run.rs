use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::format::Format;
use crate::stage::{ArtifactRef, StageError, StageErrorKind, StageInput, StageName};

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    pub extract: u32,
    pub transform: u32,
    pub load: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: StageName) -> u32 {
        match stage {
            StageName::Extract => self.extract,
            StageName::Transform => self.transform,
            StageName::Load => self.load,
        }
    }

    fn increment(&mut self, stage: StageName) {
        let slot = match stage {
            StageName::Extract => &mut self.extract,
            StageName::Transform => &mut self.transform,
            StageName::Load => &mut self.load,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageName,
    pub error: StageError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { artifact: ArtifactRef },
    Failed { error: StageError },
}

/// Summary of one finished [`StageInvocation`], kept on the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub stage: StageName,
    pub attempt: u32,
    pub input: StageInput,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// A single attempt to run a stage. Lives only for the duration of the call.
#[derive(Debug)]
pub struct StageInvocation {
    pub stage: StageName,
    pub attempt: u32,
    pub input: StageInput,
    started_at: DateTime<Utc>,
}

impl StageInvocation {
    pub fn new(stage: StageName, attempt: u32, input: StageInput) -> Self {
        Self {
            stage,
            attempt,
            input,
            started_at: Utc::now(),
        }
    }

    pub fn finish(self, result: &Result<ArtifactRef, StageError>, elapsed: Duration) -> AttemptRecord {
        let outcome = match result {
            Ok(artifact) => AttemptOutcome::Succeeded {
                artifact: artifact.clone(),
            },
            Err(error) => AttemptOutcome::Failed {
                error: error.clone(),
            },
        };
        AttemptRecord {
            stage: self.stage,
            attempt: self.attempt,
            input: self.input,
            started_at: self.started_at,
            duration_ms: elapsed.as_millis() as u64,
            outcome,
        }
    }
}

/// One execution of the ingestion pipeline.
///
/// Fields are only mutated through the crate-private transition methods, which
/// keep `artifact_refs.len()` equal to the number of completed stages and make
/// terminal states final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: RunId,
    format: Format,
    trigger: String,
    current_stage: StageName,
    status: RunStatus,
    stage_attempts: StageAttempts,
    artifact_refs: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<StageFailure>,
    #[serde(default)]
    attempts: Vec<AttemptRecord>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(format: Format, trigger: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            format,
            trigger: trigger.into(),
            current_stage: StageName::Extract,
            status: RunStatus::Running,
            stage_attempts: StageAttempts::default(),
            artifact_refs: Vec::new(),
            failure: None,
            attempts: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn current_stage(&self) -> StageName {
        self.current_stage
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stage_attempts(&self) -> &StageAttempts {
        &self.stage_attempts
    }

    pub fn artifact_refs(&self) -> &[ArtifactRef] {
        &self.artifact_refs
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stages_completed(&self) -> usize {
        self.artifact_refs.len()
    }

    pub(crate) fn record_attempt(&mut self, record: AttemptRecord) {
        if self.status.is_terminal() {
            return;
        }
        self.stage_attempts.increment(record.stage);
        self.attempts.push(record);
    }

    /// Record a successful stage and advance. Completing Load ends the run.
    pub(crate) fn complete_stage(&mut self, artifact: ArtifactRef) {
        if self.status.is_terminal() {
            return;
        }
        self.artifact_refs.push(artifact);
        match self.current_stage.next() {
            Some(next) => self.current_stage = next,
            None => self.finish(RunStatus::Succeeded),
        }
    }

    pub(crate) fn fail(&mut self, error: StageError) {
        if self.status.is_terminal() {
            return;
        }
        self.failure = Some(StageFailure {
            stage: self.current_stage,
            error,
        });
        self.finish(RunStatus::Failed);
    }

    pub(crate) fn cancel(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.finish(RunStatus::Cancelled);
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Emitted exactly once for every run that ends in [`RunStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub run_id: RunId,
    pub format: Format,
    pub failed_stage: StageName,
    pub reason: String,
    pub error_kind: StageErrorKind,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl AlertEvent {
    /// Builds the alert for a failed run, `None` for any other status.
    pub fn for_run(run: &PipelineRun) -> Option<Self> {
        if run.status() != RunStatus::Failed {
            return None;
        }
        let failure = run.failure()?;
        Some(Self {
            run_id: run.run_id(),
            format: run.format(),
            failed_stage: failure.stage,
            reason: failure.error.message.clone(),
            error_kind: failure.error.kind,
            attempts: run.stage_attempts().get(failure.stage),
            occurred_at: run.finished_at().unwrap_or_else(Utc::now),
        })
    }
}
