pub mod artifact;
pub mod builder;
pub mod cli;
pub mod command;
pub mod config;
pub mod dependency_graph;
pub mod errors;
pub mod executor;
pub mod history;
pub mod layout;
pub mod logger;
pub mod manifest;
pub mod monitor;
pub mod params;
pub mod parser;
pub mod report;
pub mod stage;
pub mod stage_runner;

pub use artifact::{Artifact, ArtifactKind, ArtifactStore, Producer};
pub use builder::{Pipeline, PipelineBuilder, PlannedStage};
pub use cli::{Cli, Commands, HistoryCommands, PipelineArgs};
pub use config::PipelineConfig;
pub use dependency_graph::PipelineGraph;
pub use errors::{FailureClass, PipelineError};
pub use executor::{Invocation, InvocationOutcome, ProcessInvoker, ToolInvoker};
pub use history::{RunHistory, RunHistoryEntry, RunRecord, StageStatus};
pub use layout::ProjectLayout;
pub use manifest::{Sample, SampleManifest};
pub use monitor::{ResourceMonitor, ResourceStats};
pub use params::{ParamValue, ParameterOverrides, ParameterSet};
pub use report::RunReport;
pub use stage::{OutputSpec, StageDefinition, StageId, StageSet};
pub use stage_runner::{PipelineRunner, RunnerOptions};
