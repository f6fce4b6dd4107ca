use super::entry::{LogComponent, LogEntry, LogLevel};
use once_cell::sync::Lazy;
use regex::Regex;

static QIIME_PLUGIN_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Plugin error from ([\w-]+):\s*(.*)$").unwrap());
static PYTHON_TRACEBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Traceback \(most recent call last\)").unwrap());
static PYTHON_EXCEPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w.]+(?:Error|Exception)): (.+)$").unwrap());
static GENERIC_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:error|fatal|failed)\b[:\s]*(.*)$").unwrap());
static GENERIC_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:warning|warn)\b[:\s]*(.*)$|UserWarning: (.*)$").unwrap());
static CUTADAPT_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(Total read pairs processed|Pairs written \(passing filters\)|Pairs that were too short|Total basepairs processed):\s+(.+)$",
    )
    .unwrap()
});
static QIIME_SAVED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Saved (\S+) to: (.+)$").unwrap());
static FASTQC_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Approx \d+% complete for (.+)$").unwrap());
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

/// Classifies output lines of the external tools into log levels.
#[derive(Clone)]
pub struct ToolOutputParser {
    component: LogComponent,
    stage: Option<String>,
    log_index: usize,
}

impl ToolOutputParser {
    pub fn new(program: &str) -> Self {
        Self {
            component: LogComponent::from_program(program),
            stage: None,
            log_index: 0,
        }
    }

    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn parse_line(&mut self, line: &str) -> LogEntry {
        let stripped = strip_ansi(line);
        let trimmed = stripped.trim();
        let index = self.log_index;
        self.log_index += 1;

        let (level, message) = classify(trimmed);
        let entry = LogEntry::new(
            level,
            message,
            line.to_string(),
            self.component.clone(),
            index,
        );

        match &self.stage {
            Some(stage) => entry.with_stage(stage.clone()),
            None => entry,
        }
    }

    /// Lines at warning level or above, in order.
    pub fn highlights(&mut self, lines: &[String]) -> Vec<LogEntry> {
        lines
            .iter()
            .map(|line| self.parse_line(line))
            .filter(|entry| entry.level >= LogLevel::Warning)
            .collect()
    }
}

fn classify(line: &str) -> (LogLevel, String) {
    if let Some(caps) = QIIME_PLUGIN_ERROR.captures(line) {
        let detail = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        return (
            LogLevel::Error,
            format!("{} plugin error {}", &caps[1], detail).trim().to_string(),
        );
    }

    if PYTHON_TRACEBACK.is_match(line) {
        return (LogLevel::Error, line.to_string());
    }

    if let Some(caps) = PYTHON_EXCEPTION.captures(line) {
        return (LogLevel::Error, format!("{}: {}", &caps[1], &caps[2]));
    }

    if let Some(caps) = GENERIC_ERROR.captures(line) {
        let detail = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let message = if detail.is_empty() { line } else { detail };
        return (LogLevel::Error, message.to_string());
    }

    if let Some(caps) = GENERIC_WARNING.captures(line) {
        let detail = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        let message = if detail.is_empty() { line } else { detail };
        return (LogLevel::Warning, message.to_string());
    }

    if let Some(caps) = CUTADAPT_SUMMARY.captures(line) {
        return (LogLevel::Info, format!("{}: {}", &caps[1], caps[2].trim()));
    }

    if let Some(caps) = QIIME_SAVED.captures(line) {
        return (LogLevel::Info, format!("saved {} to {}", &caps[1], &caps[2]));
    }

    if FASTQC_PROGRESS.is_match(line) {
        return (LogLevel::Debug, line.to_string());
    }

    (LogLevel::Info, line.to_string())
}

fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qiime_plugin_error() {
        let mut parser = ToolOutputParser::new("qiime").for_stage("denoise");
        let entry = parser.parse_line(
            "Plugin error from dada2: An error was encountered while running DADA2 in R (return code 1)",
        );

        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.component, LogComponent::Qiime);
        assert_eq!(entry.stage.as_deref(), Some("denoise"));
        assert!(entry.message.starts_with("dada2 plugin error"));
    }

    #[test]
    fn test_python_exception() {
        let mut parser = ToolOutputParser::new("/opt/conda/bin/qiime");
        let entry = parser.parse_line("ValueError: No samples remain after rarefaction");
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "ValueError: No samples remain after rarefaction");
    }

    #[test]
    fn test_cutadapt_summary() {
        let mut parser = ToolOutputParser::new("cutadapt");
        let entry = parser.parse_line("Total read pairs processed:             52,113");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, LogComponent::Trimmer);
        assert_eq!(entry.message, "Total read pairs processed: 52,113");
    }

    #[test]
    fn test_warning_and_progress() {
        let mut parser = ToolOutputParser::new("fastqc");
        assert_eq!(
            parser.parse_line("WARNING: sequence file is empty").level,
            LogLevel::Warning
        );
        assert_eq!(
            parser
                .parse_line("Approx 45% complete for 20_S1_L001_R1_001.fastq.gz")
                .level,
            LogLevel::Debug
        );
        assert_eq!(parser.parse_line("Analysis complete").level, LogLevel::Info);
    }

    #[test]
    fn test_highlights_keep_order() {
        let mut parser = ToolOutputParser::new("biom");
        let lines = vec![
            "Loading table".to_string(),
            "Warning: observation metadata missing".to_string(),
            "Error: table and metadata do not match".to_string(),
        ];
        let highlights = parser.highlights(&lines);
        assert_eq!(highlights.len(), 2);
        assert_eq!(highlights[0].level, LogLevel::Warning);
        assert_eq!(highlights[1].level, LogLevel::Error);
        assert_eq!(highlights[1].index, 2);
    }

    #[test]
    fn test_ansi_stripping() {
        let ansi_str = "\x1b[31mError:\x1b[0m Something went wrong";
        let stripped = strip_ansi(ansi_str);
        assert_eq!(stripped, "Error: Something went wrong");

        let mut parser = ToolOutputParser::new("multiqc");
        assert_eq!(parser.parse_line(ansi_str).level, LogLevel::Error);
    }
}
