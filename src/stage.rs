use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::Format;

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Extract,
    Transform,
    Load,
}

impl StageName {
    pub const ORDER: [StageName; 3] = [StageName::Extract, StageName::Transform, StageName::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Extract => "extract",
            StageName::Transform => "transform",
            StageName::Load => "load",
        }
    }

    pub fn next(&self) -> Option<StageName> {
        match self {
            StageName::Extract => Some(StageName::Transform),
            StageName::Transform => Some(StageName::Load),
            StageName::Load => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Opaque pointer to data a stage produced, e.g. an object-storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload handed to a stage. Extract receives the run's format, later stages
/// receive the previous stage's artifact untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageInput {
    Format(Format),
    Artifact(ArtifactRef),
}

impl StageInput {
    pub fn as_str(&self) -> &str {
        match self {
            StageInput::Format(format) => format.as_str(),
            StageInput::Artifact(artifact) => artifact.as_str(),
        }
    }
}

impl fmt::Display for StageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Network, throttling or timeout class. Safe to retry.
    Transient,
    /// Validation or logic class. Never retried.
    Permanent,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageErrorKind::Transient => f.write_str("transient"),
            StageErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} stage error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::transient(format!("timed out after {:.3}s", limit.as_secs_f64()))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

/// One unit of pipeline work behind a uniform call contract.
///
/// Implementations are stateless with respect to the orchestrator and never
/// retry on their own; retry policy belongs to the caller.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, stage: StageName, input: &StageInput) -> Result<ArtifactRef, StageError>;
}

/// Invoke `invoker`, converting an overrun of `limit` into a transient error.
///
/// The in-flight future is dropped on expiry, which cancels whatever the
/// invoker was awaiting.
pub async fn invoke_with_timeout(
    invoker: &dyn StageInvoker,
    stage: StageName,
    input: &StageInput,
    limit: Duration,
) -> Result<ArtifactRef, StageError> {
    match tokio::time::timeout(limit, invoker.invoke(stage, input)).await {
        Ok(result) => result,
        Err(_) => Err(StageError::timeout(limit)),
    }
}
