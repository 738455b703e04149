use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use glob::glob;
use tracing::{debug, warn};

use crate::run::{PipelineRun, RunId};

/// Persisted run records, queryable after a run completes.
pub trait RunStore: Send + Sync {
    fn save(&self, run: &PipelineRun) -> Result<()>;
    fn load(&self, run_id: RunId) -> Result<Option<PipelineRun>>;
    /// All records, most recently started first.
    fn list(&self) -> Result<Vec<PipelineRun>>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRunStore {
    inner: Arc<Mutex<HashMap<RunId, PipelineRun>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn save(&self, run: &PipelineRun) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        guard.insert(run.run_id(), run.clone());
        Ok(())
    }

    fn load(&self, run_id: RunId) -> Result<Option<PipelineRun>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        Ok(guard.get(&run_id).cloned())
    }

    fn list(&self) -> Result<Vec<PipelineRun>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        let mut runs: Vec<_> = guard.values().cloned().collect();
        sort_newest_first(&mut runs);
        Ok(runs)
    }
}

/// One pretty-printed JSON document per run under `directory`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    directory: PathBuf,
}

impl FileRunStore {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).with_context(|| {
            format!("Failed to create run record directory: {}", directory.display())
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, run_id: RunId) -> PathBuf {
        self.directory.join(format!("{run_id}.json"))
    }

    /// Delete records older than `retention` before `now`: terminal records
    /// by finish time, and `Running` records by start time, since a run that
    /// has not finished within the retention window was abandoned by its
    /// process. Returns the number removed.
    pub fn prune(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .with_context(|| format!("Retention {:?} is out of range", retention))?;
        let cutoff = now - retention;
        let mut removed = 0usize;
        for run in self.list()? {
            let expired = match run.finished_at() {
                Some(finished_at) => run.status().is_terminal() && finished_at < cutoff,
                None => run.started_at() < cutoff,
            };
            if !expired {
                continue;
            }
            if !run.status().is_terminal() {
                warn!(
                    run_id = %run.run_id(),
                    started_at = %run.started_at(),
                    "Pruning abandoned run record that never finished"
                );
            }
            let path = self.record_path(run.run_id());
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove run record: {}", path.display()))?;
            debug!(run_id = %run.run_id(), status = run.status().as_str(), "Pruned run record");
            removed += 1;
        }
        Ok(removed)
    }
}

impl RunStore for FileRunStore {
    fn save(&self, run: &PipelineRun) -> Result<()> {
        let path = self.record_path(run.run_id());
        let staging = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(run)
            .with_context(|| format!("Failed to serialize run {}", run.run_id()))?;
        fs::write(&staging, content)
            .with_context(|| format!("Failed to write run record: {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to commit run record: {}", path.display()))?;
        Ok(())
    }

    fn load(&self, run_id: RunId) -> Result<Option<PipelineRun>> {
        let path = self.record_path(run_id);
        if !path.is_file() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<PipelineRun>> {
        let pattern = self.directory.join("*.json");
        let pattern = pattern.to_string_lossy();
        let mut runs = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))? {
            let path = entry?;
            match read_record(&path) {
                Ok(run) => runs.push(run),
                Err(err) => warn!(path = %path.display(), error = ?err, "Skipping unreadable run record"),
            }
        }
        sort_newest_first(&mut runs);
        Ok(runs)
    }
}

fn read_record(path: &Path) -> Result<PipelineRun> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read run record: {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse run record: {}", path.display()))
}

fn sort_newest_first(runs: &mut [PipelineRun]) {
    runs.sort_by(|a, b| b.started_at().cmp(&a.started_at()));
}
