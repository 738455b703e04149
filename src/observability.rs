use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::run::RunStatus;
use crate::stage::StageName;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub alerts_delivered: u64,
    pub alerts_failed: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub retries: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared counters for every run driven by one orchestrator.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage: StageName) -> StageTimer {
        StageTimer {
            stage,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_retry(&self, stage: StageName) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage.as_str().to_string())
                .or_default()
                .retries += 1;
        }
    }

    pub fn record_run_started(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.runs_started += 1;
        }
    }

    pub fn record_run_finished(&self, status: RunStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                RunStatus::Succeeded => guard.runs_succeeded += 1,
                RunStatus::Failed => guard.runs_failed += 1,
                RunStatus::Cancelled => guard.runs_cancelled += 1,
                RunStatus::Running => {}
            }
        }
    }

    pub fn record_alert(&self, delivered: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if delivered {
                guard.alerts_delivered += 1;
            } else {
                guard.alerts_failed += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

/// Records one stage call when dropped.
pub struct StageTimer {
    stage: StageName,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.as_str().to_string()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            failed = self.failed,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs_started = snapshot.runs_started,
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        runs_cancelled = snapshot.runs_cancelled,
        alerts_delivered = snapshot.alerts_delivered,
        alerts_failed = snapshot.alerts_failed,
        "Ingestion metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            retries = metrics.retries,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP ps_ingestion_runs_total Pipeline runs by terminal status\n");
        output.push_str("# TYPE ps_ingestion_runs_total counter\n");
        for (status, value) in [
            ("started", self.runs_started),
            ("succeeded", self.runs_succeeded),
            ("failed", self.runs_failed),
            ("cancelled", self.runs_cancelled),
        ] {
            output.push_str(&format!(
                "ps_ingestion_runs_total{{status=\"{}\"}} {}\n",
                status, value
            ));
        }
        output.push_str("# HELP ps_ingestion_alerts_total Alert deliveries by outcome\n");
        output.push_str("# TYPE ps_ingestion_alerts_total counter\n");
        output.push_str(&format!(
            "ps_ingestion_alerts_total{{outcome=\"delivered\"}} {}\n",
            self.alerts_delivered
        ));
        output.push_str(&format!(
            "ps_ingestion_alerts_total{{outcome=\"failed\"}} {}\n",
            self.alerts_failed
        ));
        output.push_str("# HELP ps_ingestion_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE ps_ingestion_stage_calls_total counter\n");
        output.push_str("# HELP ps_ingestion_stage_failures_total Failed stage invocations\n");
        output.push_str("# TYPE ps_ingestion_stage_failures_total counter\n");
        output.push_str("# HELP ps_ingestion_stage_retries_total Stage retries scheduled\n");
        output.push_str("# TYPE ps_ingestion_stage_retries_total counter\n");
        output.push_str(
            "# HELP ps_ingestion_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE ps_ingestion_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP ps_ingestion_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE ps_ingestion_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "ps_ingestion_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "ps_ingestion_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "ps_ingestion_stage_retries_total{{stage=\"{}\"}} {}\n",
                stage, metrics.retries
            ));
            output.push_str(&format!(
                "ps_ingestion_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "ps_ingestion_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}
