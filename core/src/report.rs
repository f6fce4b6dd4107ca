use crate::errors::FailureClass;
use crate::history::{RunHistoryEntry, RunRecord, StageStatus};
use crate::logger::Logger;
use crate::parser::{LogLevel, ToolOutputParser};

/// Final state of one run, as printed after `run` and by `status`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub entry: RunHistoryEntry,
    pub failure: Option<FailureClass>,
}

impl RunReport {
    pub fn new(entry: RunHistoryEntry, failure: Option<FailureClass>) -> Self {
        Self { entry, failure }
    }

    /// Rebuilds a report from a stored run; failed stages count as tool failures.
    pub fn from_entry(entry: RunHistoryEntry) -> Self {
        let failure = (entry.count(StageStatus::Failed) > 0).then_some(FailureClass::ToolFailure);
        Self { entry, failure }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        self.failure.map(FailureClass::exit_code).unwrap_or(0)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.entry.count(status)
    }

    pub fn record(&self, stage: &str) -> Option<&RunRecord> {
        self.entry.record(stage)
    }

    pub fn render(&self, logger: &Logger) {
        let entry = &self.entry;
        logger.info(&format!("Run {} of '{}'", entry.run_id, entry.pipeline));

        for record in &entry.records {
            let timing = record
                .duration_ms
                .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
                .unwrap_or_default();
            let line = format!("  {:<12} {}{}", record.status.label(), record.stage, timing);

            match record.status {
                StageStatus::Failed => {
                    logger.error(&line);
                    render_failure(logger, record);
                }
                StageStatus::NotStarted | StageStatus::Pending | StageStatus::Running => {
                    logger.warn(&line)
                }
                _ if record.stale => logger.warn(&format!(
                    "{}  outputs predate a parameter change",
                    line
                )),
                _ => logger.info(&line),
            }
        }

        let summary = format!(
            "{} succeeded, {} skipped, {} failed, {} not started",
            self.count(StageStatus::Succeeded),
            self.count(StageStatus::Skipped),
            self.count(StageStatus::Failed),
            self.count(StageStatus::NotStarted),
        );

        if let Some(resources) = &entry.resources {
            if resources.sample_count > 0 {
                logger.info(&format!(
                    "Peak CPU {:.0}%, peak memory {:.0} MB",
                    resources.peak_cpu, resources.peak_memory_mb
                ));
            }
        }

        let duration = entry
            .duration_secs()
            .map(|secs| format!(" in {:.1}s", secs))
            .unwrap_or_default();

        if self.succeeded() {
            logger.info(&format!("Pipeline finished{}: {}", duration, summary));
        } else {
            logger.error(&format!("Pipeline failed{}: {}", duration, summary));
        }
    }
}

fn render_failure(logger: &Logger, record: &RunRecord) {
    if let Some(error) = &record.error {
        logger.error(&format!("    {}", error));
    }
    logger.log(LogLevel::Info, &format!("    command: {}", record.command));
    logger.log(
        LogLevel::Info,
        &format!("    log: {}", record.log_path.display()),
    );

    if record.log_excerpt.is_empty() {
        return;
    }

    let mut parser = ToolOutputParser::new(&record.tool).for_stage(record.stage.clone());
    let highlights = parser.highlights(&record.log_excerpt);

    if highlights.is_empty() {
        for line in &record.log_excerpt {
            logger.log(LogLevel::Info, &format!("    | {}", line));
        }
    } else {
        for entry in highlights {
            logger.log(entry.level, &format!("    | {}", entry.message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(stage: &str, status: StageStatus) -> RunRecord {
        let mut record = RunRecord::new(
            stage,
            "qiime",
            format!("qiime {}", stage),
            PathBuf::from(format!("logs/{stage}.log")),
            "f",
        );
        record.status = status;
        record
    }

    #[test]
    fn test_exit_code_and_counts() {
        let entry = RunHistoryEntry::new(
            "chain",
            vec![
                record("a", StageStatus::Succeeded),
                record("b", StageStatus::Failed),
                record("c", StageStatus::NotStarted),
            ],
        );
        let report = RunReport::from_entry(entry);

        assert!(!report.succeeded());
        assert_eq!(report.exit_code(), 4);
        assert_eq!(report.count(StageStatus::NotStarted), 1);
        assert_eq!(report.record("b").unwrap().status, StageStatus::Failed);

        report.render(&Logger::plain());
    }

    #[test]
    fn test_clean_run_exits_zero() {
        let mut entry = RunHistoryEntry::new(
            "chain",
            vec![
                record("a", StageStatus::Skipped),
                record("b", StageStatus::Succeeded),
            ],
        );
        entry.finalize(None);
        let report = RunReport::from_entry(entry);

        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.entry.success, Some(true));
    }
}
