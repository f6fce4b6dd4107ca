use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error in {}: {message}", .path.display())]
    Configuration { path: PathBuf, message: String },

    #[error("missing input '{name}': {} does not exist", .path.display())]
    MissingInput { name: String, path: PathBuf },

    #[error("invalid stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("cyclic dependency between stages: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact path {} claimed by both '{first}' and '{second}'", .path.display())]
    ArtifactCollision {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("stage '{stage}' failed: {command} {}", describe_exit(.exit_code))]
    ToolFailure {
        stage: String,
        command: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        log_tail: Vec<String>,
    },

    #[error("stage '{stage}' timed out after {}s: {command}", .limit.as_secs())]
    ToolTimeout {
        stage: String,
        command: String,
        args: Vec<String>,
        limit: Duration,
        log_tail: Vec<String>,
    },

    #[error("stage '{stage}' finished but did not produce '{artifact}' at {}", .path.display())]
    MissingOutput {
        stage: String,
        artifact: String,
        path: PathBuf,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Configuration,
    MissingInput,
    ToolFailure,
    Cycle,
    Definition,
    Internal,
}

impl FailureClass {
    pub fn exit_code(self) -> i32 {
        match self {
            FailureClass::Configuration => 2,
            FailureClass::MissingInput => 3,
            FailureClass::ToolFailure => 4,
            FailureClass::Cycle => 5,
            FailureClass::Definition => 6,
            FailureClass::Internal => 70,
        }
    }
}

impl PipelineError {
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidStage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::Configuration { .. } => FailureClass::Configuration,
            PipelineError::MissingInput { .. } => FailureClass::MissingInput,
            PipelineError::InvalidStage { .. } | PipelineError::ArtifactCollision { .. } => {
                FailureClass::Definition
            }
            PipelineError::CyclicDependency(_) => FailureClass::Cycle,
            PipelineError::ToolFailure { .. }
            | PipelineError::ToolTimeout { .. }
            | PipelineError::MissingOutput { .. } => FailureClass::ToolFailure,
            PipelineError::ArtifactNotFound(_) | PipelineError::Io { .. } => FailureClass::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }

    /// Command line and captured output for failures raised by an external tool.
    pub fn tool_context(&self) -> Option<(String, &[String])> {
        match self {
            PipelineError::ToolFailure {
                command,
                args,
                log_tail,
                ..
            }
            | PipelineError::ToolTimeout {
                command,
                args,
                log_tail,
                ..
            } => Some((command_line(command, args), log_tail.as_slice())),
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "terminated without an exit code".to_string(),
    }
}

/// Shell-like rendering of a command, quoting arguments that contain whitespace.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'') {
            line.push('\'');
            line.push_str(&arg.replace('\'', "'\\''"));
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}
