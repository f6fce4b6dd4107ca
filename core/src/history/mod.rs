pub mod storage;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::monitor::ResourceStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    NotStarted,
}

impl StageStatus {
    /// Dependents may start once a stage is in one of these states.
    pub fn is_done(self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }

    pub fn label(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::NotStarted => "not-started",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Outcome of one stage within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub stage: String,
    pub status: StageStatus,
    pub tool: String,
    pub command: String,
    pub log_path: PathBuf,
    pub fingerprint: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_excerpt: Vec<String>,
    /// Skipped over outputs that were produced with different parameters.
    #[serde(default)]
    pub stale: bool,
}

impl RunRecord {
    pub fn new(
        stage: impl Into<String>,
        tool: impl Into<String>,
        command: impl Into<String>,
        log_path: PathBuf,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            tool: tool.into(),
            command: command.into(),
            log_path,
            fingerprint: fingerprint.into(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            duration_ms: None,
            error: None,
            log_excerpt: Vec::new(),
            stale: false,
        }
    }

    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Local::now());
    }

    pub fn finish(&mut self, status: StageStatus) {
        self.status = status;
        let now = Local::now();
        self.finished_at = Some(now);
        if self.duration_ms.is_none() {
            if let Some(started) = self.started_at {
                self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: String,
    pub pipeline: String,
    pub started_at: DateTime<Local>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Local>>,
    /// `None` while the run is in progress or was interrupted.
    #[serde(default)]
    pub success: Option<bool>,
    pub records: Vec<RunRecord>,
    #[serde(default)]
    pub resources: Option<ResourceStats>,
}

impl RunHistoryEntry {
    pub fn new(pipeline: impl Into<String>, records: Vec<RunRecord>) -> Self {
        let started_at = Local::now();
        Self {
            run_id: started_at.format("%Y%m%dT%H%M%S%.3f").to_string(),
            pipeline: pipeline.into(),
            started_at,
            finished_at: None,
            success: None,
            records,
            resources: None,
        }
    }

    pub fn record(&self, stage: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.stage == stage)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn finalize(&mut self, resources: Option<ResourceStats>) {
        self.finished_at = Some(Local::now());
        self.success = Some(self.records.iter().all(|r| r.status.is_done()));
        self.resources = resources;
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

pub struct RunHistory {
    entries: Vec<RunHistoryEntry>,
    storage_path: PathBuf,
    max_runs: usize,
}

impl RunHistory {
    pub fn new(storage_path: PathBuf, max_runs: usize) -> anyhow::Result<Self> {
        let entries = storage::load_history(&storage_path)?;
        Ok(Self {
            entries,
            storage_path,
            max_runs: max_runs.max(1),
        })
    }

    /// Inserts or replaces the entry with the same run id, then saves.
    pub fn upsert(&mut self, entry: &RunHistoryEntry) -> anyhow::Result<()> {
        match self.entries.iter_mut().find(|e| e.run_id == entry.run_id) {
            Some(existing) => *existing = entry.clone(),
            None => self.entries.push(entry.clone()),
        }

        while self.entries.len() > self.max_runs {
            self.entries.remove(0);
        }

        storage::save_history(&self.storage_path, &self.entries)
    }

    pub fn entries(&self) -> &[RunHistoryEntry] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&RunHistoryEntry> {
        self.entries.last()
    }

    /// Most recent record in which `stage` actually ran to success.
    pub fn last_success(&self, stage: &str) -> Option<&RunRecord> {
        self.entries
            .iter()
            .rev()
            .filter_map(|entry| entry.record(stage))
            .find(|record| record.status == StageStatus::Succeeded)
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        storage::save_history(&self.storage_path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(run_id: &str, status: StageStatus, fingerprint: &str) -> RunHistoryEntry {
        let mut record = RunRecord::new(
            "denoise",
            "qiime",
            "qiime dada2 denoise-paired",
            PathBuf::from("logs/denoise.log"),
            fingerprint,
        );
        record.status = status;
        let mut entry = RunHistoryEntry::new("amplicon-16s", vec![record]);
        entry.run_id = run_id.to_string();
        entry
    }

    #[test]
    fn test_history_is_bounded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/history.json");

        let mut history = RunHistory::new(path.clone(), 2).unwrap();
        for id in ["r1", "r2", "r3"] {
            history
                .upsert(&entry(id, StageStatus::Succeeded, "f"))
                .unwrap();
        }

        let reloaded = RunHistory::new(path, 2).unwrap();
        let ids: Vec<&str> = reloaded.entries().iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
    }

    #[test]
    fn test_upsert_replaces_same_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = RunHistory::new(dir.path().join("history.json"), 5).unwrap();

        let mut run = entry("r1", StageStatus::Running, "f");
        history.upsert(&run).unwrap();
        run.records[0].status = StageStatus::Failed;
        run.finalize(None);
        history.upsert(&run).unwrap();

        assert_eq!(history.entries().len(), 1);
        assert_eq!(history.last_entry().unwrap().success, Some(false));
    }

    #[test]
    fn test_last_success_ignores_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = RunHistory::new(dir.path().join("history.json"), 5).unwrap();
        history
            .upsert(&entry("r1", StageStatus::Succeeded, "old"))
            .unwrap();
        history
            .upsert(&entry("r2", StageStatus::Skipped, "new"))
            .unwrap();

        assert_eq!(history.last_success("denoise").unwrap().fingerprint, "old");
        assert!(history.last_success("classify").is_none());

        history.clear().unwrap();
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(StageStatus::NotStarted.to_string(), "not-started");
        assert_eq!(
            serde_json::to_string(&StageStatus::NotStarted).unwrap(),
            "\"not-started\""
        );
        assert!(StageStatus::Skipped.is_done());
        assert!(!StageStatus::Failed.is_done());
    }
}
