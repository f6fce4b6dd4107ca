use crate::parser::entry::{LogEntry, LogLevel};
use std::io::Write;

pub struct Logger {
    use_colors: bool,
    verbose: bool,
}

impl Logger {
    pub fn new() -> Self {
        Self {
            use_colors: atty::is(atty::Stream::Stdout),
            verbose: false,
        }
    }

    pub fn plain() -> Self {
        Self {
            use_colors: false,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level == LogLevel::Debug && !self.verbose {
            return;
        }

        let timestamp = chrono::Local::now().format("%H:%M:%S");
        if self.use_colors {
            println!(
                "\x1b[90m[{}]\x1b[0m {}{}\x1b[0m",
                timestamp,
                color(level),
                message
            );
        } else {
            println!("[{}] {:<7} {}", timestamp, level.to_str(), message);
        }
    }

    pub fn stage(&self, level: LogLevel, stage: &str, message: &str) {
        self.log(level, &format!("[{}] {}", stage, message));
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Echoes one classified line of tool output.
    pub fn log_entry(&self, entry: &LogEntry) {
        if entry.level == LogLevel::Debug && !self.verbose {
            return;
        }

        let timestamp = entry.timestamp.format("%H:%M:%S");
        let stage = entry.stage.as_deref().unwrap_or("-");

        if self.use_colors {
            println!(
                "\x1b[90m[{}]\x1b[0m \x1b[36m{}\x1b[0m {}{}\x1b[0m",
                timestamp,
                stage,
                color(entry.level),
                entry.raw_line
            );
        } else {
            println!("[{}] {} | {}", timestamp, stage, entry.raw_line);
        }

        let _ = std::io::stdout().flush();
    }
}

fn color(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "\x1b[90m",
        LogLevel::Info => "\x1b[37m",
        LogLevel::Warning => "\x1b[33m",
        LogLevel::Error => "\x1b[31m",
        LogLevel::Fatal => "\x1b[31;1m",
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}
