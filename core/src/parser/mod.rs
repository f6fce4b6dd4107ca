pub mod entry;
pub mod parser;

pub use entry::{LogComponent, LogEntry, LogLevel};
pub use parser::ToolOutputParser;
