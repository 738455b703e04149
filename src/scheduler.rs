use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::format::Format;
use crate::pipeline::{CancelHandle, PipelineOrchestrator};
use crate::run::{PipelineRun, RunId};

/// A named daily trigger. Times are wall-clock UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    pub format: Format,
    pub hour: u32,
    pub minute: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TriggerSpec {
    pub fn daily(name: impl Into<String>, format: Format, hour: u32, minute: u32) -> Self {
        Self {
            name: name.into(),
            format,
            hour,
            minute,
            enabled: true,
        }
    }

    pub fn time_of_day(&self) -> Result<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).ok_or_else(|| {
            anyhow!(
                "Trigger '{}' has invalid time {:02}:{:02}",
                self.name,
                self.hour,
                self.minute
            )
        })
    }

    /// First firing strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let time = self.time_of_day()?;
        let candidate = after.date_naive().and_time(time).and_utc();
        if candidate > after {
            Ok(candidate)
        } else {
            Ok(candidate + Days::new(1))
        }
    }

    /// Equivalent EventBridge-style schedule expression.
    pub fn cron_expression(&self) -> String {
        format!("cron({} {} * * ? *)", self.minute, self.hour)
    }
}

/// Fires pipeline runs on fixed daily triggers.
///
/// A firing never waits on earlier runs: each trigger spawns its own run,
/// so runs for different formats overlap freely.
pub struct Scheduler {
    triggers: Vec<TriggerSpec>,
    cancel: CancelHandle,
    clock: Clock,
}

/// Source of the current wall-clock time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

impl Scheduler {
    pub fn new(triggers: Vec<TriggerSpec>) -> Self {
        Self {
            triggers: triggers.into_iter().filter(|t| t.enabled).collect(),
            cancel: CancelHandle::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the system clock, e.g. with one driven by tokio's paused time.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn triggers(&self) -> &[TriggerSpec] {
        &self.triggers
    }

    /// Earliest firing time strictly after `after`, with every trigger due
    /// at that instant.
    pub fn next_due(&self, after: DateTime<Utc>) -> Result<Option<(DateTime<Utc>, Vec<TriggerSpec>)>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut due = Vec::new();
        for trigger in &self.triggers {
            let at = trigger.next_fire_after(after)?;
            match earliest {
                Some(current) if at > current => {}
                Some(current) if at == current => due.push(trigger.clone()),
                _ => {
                    earliest = Some(at);
                    due = vec![trigger.clone()];
                }
            }
        }
        Ok(earliest.map(|at| (at, due)))
    }

    /// Create exactly one run for `trigger` and drive it on its own task.
    pub fn fire(
        &self,
        trigger: &TriggerSpec,
        orchestrator: &Arc<PipelineOrchestrator>,
        runs: &mut JoinSet<Result<PipelineRun>>,
    ) -> RunId {
        let run = PipelineRun::new(trigger.format, trigger.name.clone());
        let run_id = run.run_id();
        info!(
            trigger = trigger.name.as_str(),
            format = %trigger.format,
            run_id = %run_id,
            "Trigger fired"
        );
        let orchestrator = Arc::clone(orchestrator);
        let cancel = self.cancel.clone();
        runs.spawn(async move { orchestrator.drive(run, &cancel).await });
        run_id
    }

    /// Fire triggers as they come due until `shutdown` resolves, then cancel
    /// in-flight runs at their next stage boundary and wait for them.
    /// Returns the number of runs fired.
    pub async fn run<F>(&self, orchestrator: Arc<PipelineOrchestrator>, shutdown: F) -> Result<usize>
    where
        F: Future<Output = ()>,
    {
        info!(triggers = self.triggers.len(), "Scheduler started");
        for trigger in &self.triggers {
            info!(
                trigger = trigger.name.as_str(),
                format = %trigger.format,
                schedule = trigger.cron_expression().as_str(),
                "Trigger registered"
            );
        }

        let mut runs = JoinSet::new();
        let mut fired = 0usize;
        let mut cursor = (self.clock)();
        tokio::pin!(shutdown);

        loop {
            let now = (self.clock)().max(cursor);
            let next = self.next_due(now).context("Failed to compute next trigger")?;
            let Some((due_at, due)) = next else {
                warn!("No enabled triggers, waiting for shutdown");
                (&mut shutdown).await;
                break;
            };
            let wait = (due_at - now).to_std().unwrap_or_default();
            debug!(due_at = %due_at, wait_secs = wait.as_secs(), "Sleeping until next trigger");

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    for trigger in &due {
                        self.fire(trigger, &orchestrator, &mut runs);
                        fired += 1;
                    }
                    cursor = due_at;
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    log_completion(joined);
                }
            }
        }

        if !runs.is_empty() {
            info!(in_flight = runs.len(), "Cancelling in-flight runs at next stage boundary");
            self.cancel.cancel();
        }
        while let Some(joined) = runs.join_next().await {
            log_completion(joined);
        }
        info!(fired, "Scheduler stopped");
        Ok(fired)
    }
}

fn log_completion(joined: Result<Result<PipelineRun>, JoinError>) {
    match joined {
        Ok(Ok(run)) => info!(
            run_id = %run.run_id(),
            format = %run.format(),
            status = run.status().as_str(),
            "Scheduled run finished"
        ),
        Ok(Err(err)) => error!(error = ?err, "Scheduled run could not be recorded"),
        Err(err) => error!(error = %err, "Scheduled run task panicked"),
    }
}
