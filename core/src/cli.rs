use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ampliflow")]
#[command(author, version, about = "Runs 16S amplicon pipelines stage by stage", long_about = None)]
pub struct Cli {
    #[arg(
        short = 'C',
        long = "directory",
        value_name = "DIR",
        global = true,
        help = "Project directory"
    )]
    pub project_dir: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Show debug output and echo tool logs")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that builds the pipeline.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    #[arg(value_name = "PIPELINE", default_value = "pipeline.toml", help = "Pipeline file")]
    pub pipeline: PathBuf,

    #[arg(long, value_name = "FILE", help = "Parameter overrides (flat TOML table)")]
    pub params: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Sample manifest, instead of the pipeline's")]
    pub manifest: Option<PathBuf>,

    #[arg(long = "set", value_name = "KEY=VALUE", help = "Override one parameter")]
    pub set: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    #[command(about = "Show recent runs")]
    Show {
        #[arg(default_value = "pipeline.toml", help = "Pipeline file")]
        pipeline: PathBuf,

        #[arg(short, long, help = "Number of entries to show")]
        count: Option<usize>,
    },

    #[command(about = "Clear run history")]
    Clear {
        #[arg(default_value = "pipeline.toml", help = "Pipeline file")]
        pipeline: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the pipeline, skipping stages whose outputs exist")]
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[arg(long, value_name = "N", help = "Maximum stages running at once")]
        max_parallel: Option<usize>,

        #[arg(long, value_name = "SECS", help = "Timeout for stages without their own")]
        timeout: Option<u64>,

        #[arg(long, value_name = "STAGE", help = "Run this stage even if its outputs exist")]
        rerun: Vec<String>,
    },

    #[command(about = "Print the execution plan without running anything")]
    Plan {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    #[command(about = "Show the outcome of the latest run")]
    Status {
        #[arg(default_value = "pipeline.toml", help = "Pipeline file")]
        pipeline: PathBuf,
    },

    #[command(about = "Manage run history")]
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    #[command(about = "Write the 16S preset and a manifest template")]
    Init {
        #[arg(long, help = "Pipeline name")]
        name: Option<String>,

        #[arg(long, value_name = "DB", help = "Reference database directory name")]
        reference_db: Option<String>,
    },
}

impl Cli {
    pub fn project_directory(&self) -> std::io::Result<PathBuf> {
        match &self.project_dir {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).as_ref())),
            None => std::env::current_dir(),
        }
    }

    /// Resolves a path given on the command line against the project directory.
    pub fn resolve(&self, path: &std::path::Path) -> std::io::Result<PathBuf> {
        let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
        if expanded.is_absolute() {
            Ok(expanded)
        } else {
            Ok(self.project_directory()?.join(expanded))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "ampliflow",
            "-C",
            "/data/run-7",
            "run",
            "16s.toml",
            "--set",
            "threads=8",
            "--set",
            "trunc_len_f=240",
            "--rerun",
            "denoise",
            "--max-parallel",
            "4",
        ])
        .unwrap();

        assert_eq!(
            cli.resolve(std::path::Path::new("16s.toml")).unwrap(),
            PathBuf::from("/data/run-7/16s.toml")
        );
        match cli.command {
            Commands::Run {
                pipeline,
                max_parallel,
                timeout,
                rerun,
            } => {
                assert_eq!(pipeline.pipeline, PathBuf::from("16s.toml"));
                assert_eq!(pipeline.set, vec!["threads=8", "trunc_len_f=240"]);
                assert_eq!(max_parallel, Some(4));
                assert_eq!(timeout, None);
                assert_eq!(rerun, vec!["denoise"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_defaults_to_project_file() {
        let cli = Cli::try_parse_from(["ampliflow", "history", "show", "--count", "3"]).unwrap();
        match cli.command {
            Commands::History {
                command: HistoryCommands::Show { pipeline, count },
            } => {
                assert_eq!(pipeline, PathBuf::from("pipeline.toml"));
                assert_eq!(count, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
