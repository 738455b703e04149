use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{Instrument, error, info, instrument, warn};

use crate::alert::{self, AlertSink, DeliveryPolicy};
use crate::config::{IngestionConfig, StageConfig, StorageConfig};
use crate::format::Format;
use crate::observability::MetricsCollector;
use crate::retry::RetryPolicy;
use crate::run::{AlertEvent, PipelineRun, RunStatus, StageInvocation};
use crate::stage::{ArtifactRef, StageError, StageInput, StageInvoker, StageName, invoke_with_timeout};
use crate::store::RunStore;

type InvokerConstructor = Arc<
    dyn Fn(StageName, &StageConfig, &StorageConfig) -> Result<Arc<dyn StageInvoker>> + Send + Sync,
>;

/// Maps invoker kinds named in the configuration to constructors.
pub struct StageRegistry {
    factories: HashMap<String, InvokerConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageName, &StageConfig, &StorageConfig) -> Result<Arc<dyn StageInvoker>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        stage: StageName,
        config: &StageConfig,
        storage: &StorageConfig,
    ) -> Result<Arc<dyn StageInvoker>> {
        let factory = self.factories.get(&config.invoker).ok_or_else(|| {
            anyhow!(
                "Unknown invoker '{}'. Available invokers: {}",
                config.invoker,
                self.known_invokers().join(", ")
            )
        })?;
        factory(stage, config, storage)
    }

    pub fn known_invokers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// How one stage is called: the invoker plus its timeout and retry bounds.
#[derive(Clone)]
pub struct StagePlan {
    pub invoker: Arc<dyn StageInvoker>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl StagePlan {
    pub fn new(invoker: Arc<dyn StageInvoker>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            invoker,
            timeout,
            retry,
        }
    }
}

#[derive(Clone)]
pub struct StagePlans {
    pub extract: StagePlan,
    pub transform: StagePlan,
    pub load: StagePlan,
}

impl StagePlans {
    pub fn get(&self, stage: StageName) -> &StagePlan {
        match stage {
            StageName::Extract => &self.extract,
            StageName::Transform => &self.transform,
            StageName::Load => &self.load,
        }
    }
}

/// Cooperative cancellation flag, observed when a run is about to enter a
/// stage. An in-flight stage call always runs to completion or timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Drives runs through extract, transform and load.
///
/// The orchestrator holds no per-run state, so one instance can drive any
/// number of concurrent runs; each run owns its [`PipelineRun`].
pub struct PipelineOrchestrator {
    plans: StagePlans,
    alerts: Arc<dyn AlertSink>,
    delivery: DeliveryPolicy,
    store: Arc<dyn RunStore>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    pub fn new(plans: StagePlans, alerts: Arc<dyn AlertSink>, store: Arc<dyn RunStore>) -> Self {
        Self {
            plans,
            alerts,
            delivery: DeliveryPolicy::default(),
            store,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_delivery_policy(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Start and drive a new run to a terminal state.
    pub async fn execute(&self, format: Format, trigger: &str) -> Result<PipelineRun> {
        self.drive(PipelineRun::new(format, trigger), &CancelHandle::default())
            .await
    }

    /// Drive `run` until it succeeds, fails or is cancelled.
    ///
    /// A run that is already terminal is returned untouched: it is not
    /// counted, alerted on or saved again. A `Running` run resumes at its
    /// current stage with the last recorded artifact as input.
    ///
    /// Only a failure to persist the terminal record is returned as an error;
    /// stage failures are part of the returned run.
    #[instrument(
        skip_all,
        fields(run_id = %run.run_id(), format = %run.format(), trigger = run.trigger())
    )]
    pub async fn drive(&self, mut run: PipelineRun, cancel: &CancelHandle) -> Result<PipelineRun> {
        if run.status().is_terminal() {
            warn!(status = run.status().as_str(), "Run already finished, not driving it again");
            return Ok(run);
        }
        self.metrics.record_run_started();
        info!(stage = %run.current_stage(), "Pipeline run started");
        self.checkpoint(&run).await;

        let mut input = match run.artifact_refs().last() {
            Some(artifact) => StageInput::Artifact(artifact.clone()),
            None => StageInput::Format(run.format()),
        };
        while !run.status().is_terminal() {
            let stage = run.current_stage();
            if cancel.is_cancelled() {
                warn!(stage = %stage, "Run cancelled before stage entry");
                run.cancel();
                break;
            }
            match self.run_stage(&mut run, stage, &input).await {
                Ok(artifact) => {
                    info!(stage = %stage, artifact = %artifact, "Stage completed");
                    run.complete_stage(artifact.clone());
                    input = StageInput::Artifact(artifact);
                }
                Err(err) => run.fail(err),
            }
            if !run.status().is_terminal() {
                self.checkpoint(&run).await;
            }
        }

        self.metrics.record_run_finished(run.status());
        match run.status() {
            RunStatus::Succeeded => info!(
                artifacts = run.artifact_refs().len(),
                "Pipeline run succeeded"
            ),
            RunStatus::Failed => {
                if let Some(failure) = run.failure() {
                    error!(
                        stage = %failure.stage,
                        kind = %failure.error.kind,
                        reason = failure.error.message.as_str(),
                        "Pipeline run failed"
                    );
                }
                self.raise_alert(&run).await;
            }
            RunStatus::Cancelled => warn!(
                completed = run.stages_completed(),
                "Pipeline run cancelled"
            ),
            RunStatus::Running => {}
        }

        self.persist(&run)
            .await
            .with_context(|| format!("Failed to persist final record for run {}", run.run_id()))?;
        Ok(run)
    }

    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        stage: StageName,
        input: &StageInput,
    ) -> Result<ArtifactRef, StageError> {
        let plan = self.plans.get(stage);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let invocation = StageInvocation::new(stage, attempt, input.clone());
            let span = tracing::span!(
                tracing::Level::DEBUG,
                "stage",
                stage = stage.as_str(),
                attempt
            );
            let mut timer = self.metrics.start_stage(stage);
            let started = Instant::now();
            let result = invoke_with_timeout(
                plan.invoker.as_ref(),
                stage,
                &invocation.input,
                plan.timeout,
            )
            .instrument(span)
            .await;
            if result.is_err() {
                timer.mark_failed();
            }
            drop(timer);
            run.record_attempt(invocation.finish(&result, started.elapsed()));

            match result {
                Ok(artifact) => return Ok(artifact),
                Err(err) if err.is_retryable() && plan.retry.allows_retry(attempt) => {
                    let delay = plan.retry.delay_for(attempt);
                    warn!(
                        stage = %stage,
                        attempt,
                        max_attempts = plan.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient stage error, will retry"
                    );
                    self.metrics.record_retry(stage);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        error!(
                            stage = %stage,
                            attempt,
                            error = %err,
                            "Retries exhausted, failing run"
                        );
                    } else {
                        error!(
                            stage = %stage,
                            attempt,
                            error = %err,
                            "Permanent stage error, failing run"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn raise_alert(&self, run: &PipelineRun) {
        let Some(event) = AlertEvent::for_run(run) else {
            return;
        };
        let delivered = alert::deliver(self.alerts.as_ref(), &event, &self.delivery).await;
        self.metrics.record_alert(delivered);
    }

    async fn checkpoint(&self, run: &PipelineRun) {
        if let Err(err) = self.persist(run).await {
            warn!(error = ?err, "Failed to checkpoint run record");
        }
    }

    /// Saves off the async worker threads; stores do synchronous I/O.
    async fn persist(&self, run: &PipelineRun) -> Result<()> {
        let store = Arc::clone(&self.store);
        let record = run.clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .context("Run store task failed")?
    }
}

pub fn build_orchestrator(
    config: &IngestionConfig,
    registry: &StageRegistry,
    store: Arc<dyn RunStore>,
) -> Result<PipelineOrchestrator> {
    let plan = |stage: StageName| -> Result<StagePlan> {
        let stage_config = config.stages.get(stage);
        let invoker = registry
            .create(stage, stage_config, &config.storage)
            .with_context(|| format!("Failed to build invoker for stage '{stage}'"))?;
        Ok(StagePlan::new(
            invoker,
            stage_config.timeout(),
            stage_config.retry.clone(),
        ))
    };
    let plans = StagePlans {
        extract: plan(StageName::Extract)?,
        transform: plan(StageName::Transform)?,
        load: plan(StageName::Load)?,
    };
    let alerts = alert::build_sink(&config.qualified_service(), &config.alerts)?;
    Ok(PipelineOrchestrator::new(plans, alerts, store)
        .with_delivery_policy(DeliveryPolicy::from(&config.alerts)))
}
