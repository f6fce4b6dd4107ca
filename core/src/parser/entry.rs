use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn to_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// Which family of external tool produced a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogComponent {
    Trimmer,
    QualityReport,
    Qiime,
    Blast,
    Biom,
    Other(String),
}

impl LogComponent {
    pub fn from_program(program: &str) -> Self {
        let name = std::path::Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string());

        match name.as_str() {
            "cutadapt" => LogComponent::Trimmer,
            "fastqc" | "multiqc" => LogComponent::QualityReport,
            "qiime" => LogComponent::Qiime,
            "blastn" | "makeblastdb" => LogComponent::Blast,
            "biom" => LogComponent::Biom,
            _ => LogComponent::Other(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
    pub raw_line: String,
    pub component: LogComponent,
    pub stage: Option<String>,
    pub index: usize,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        message: String,
        raw_line: String,
        component: LogComponent,
        index: usize,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message,
            raw_line,
            component,
            stage: None,
            index,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}
