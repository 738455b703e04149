pub mod alert;
pub mod config;
pub mod format;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod store;
pub mod validation;

pub use config::IngestionConfig;
pub use format::Format;
pub use pipeline::{CancelHandle, PipelineOrchestrator, StageRegistry, build_orchestrator};
pub use run::{AlertEvent, PipelineRun, RunStatus};
pub use stage::{ArtifactRef, StageError, StageErrorKind, StageInput, StageInvoker, StageName};
