use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ampliflow_core::cli::{Commands, HistoryCommands, PipelineArgs};
use ampliflow_core::logger::Logger;
use ampliflow_core::parser::LogLevel;
use ampliflow_core::{
    Cli, ParameterOverrides, Pipeline, PipelineBuilder, PipelineConfig, PipelineError,
    PipelineRunner, ProcessInvoker, ProjectLayout, ResourceMonitor, RunHistory, RunReport,
    RunnerOptions, SampleManifest, StageStatus,
};

fn load_config(cli: &Cli, path: &Path) -> Result<PipelineConfig> {
    let path = cli
        .resolve(path)
        .context("Failed to determine project directory")?;
    Ok(PipelineConfig::load_from_file(path)?)
}

fn build_pipeline(
    cli: &Cli,
    config: &PipelineConfig,
    args: &PipelineArgs,
    timeout: Option<Duration>,
) -> Result<Pipeline> {
    let manifest_path = match &args.manifest {
        Some(path) => cli.resolve(path)?,
        None => config.manifest_path(),
    };
    let manifest = SampleManifest::load_from_file(&manifest_path)?;

    let mut overrides = match &args.params {
        Some(path) => ParameterOverrides::load_from_file(cli.resolve(path)?)?,
        None => ParameterOverrides::default(),
    };
    overrides = overrides.with_assignments(&args.set)?;

    let pipeline = PipelineBuilder::new(config, manifest)?
        .with_overrides(&overrides)?
        .with_timeout(timeout)
        .build()?;
    Ok(pipeline)
}

async fn run_pipeline(
    cli: &Cli,
    logger: Arc<Logger>,
    args: &PipelineArgs,
    max_parallel: Option<usize>,
    timeout: Option<u64>,
    rerun: &[String],
) -> Result<i32> {
    let config = load_config(cli, &args.pipeline)?;

    if max_parallel == Some(0) {
        return Err(PipelineError::config("--max-parallel", "must be at least 1").into());
    }
    if timeout == Some(0) {
        return Err(PipelineError::config("--timeout", "must be positive").into());
    }

    let mut pipeline = build_pipeline(cli, &config, args, timeout.map(Duration::from_secs))?;
    logger.debug(&format!(
        "Manifest {}, run history {}",
        pipeline.manifest.path().display(),
        pipeline.history_path().display()
    ));

    let monitor = ResourceMonitor::new();
    let mut invoker = ProcessInvoker::new().with_monitor(monitor.clone());
    if logger.is_verbose() {
        invoker = invoker.with_echo(logger.clone());
    }

    let runner = PipelineRunner::new(Arc::new(invoker), logger.clone())
        .with_monitor(monitor)
        .with_options(RunnerOptions {
            max_parallel,
            rerun: rerun.to_vec(),
        });

    let report = runner.run(&mut pipeline).await?;
    report.render(&logger);
    logger.log(
        LogLevel::Info,
        &format!("Stage logs: {}", pipeline.layout.log_dir().display()),
    );

    Ok(report.exit_code())
}

fn plan_pipeline(cli: &Cli, args: &PipelineArgs) -> Result<i32> {
    let config = load_config(cli, &args.pipeline)?;
    let pipeline = build_pipeline(cli, &config, args, None)?;

    println!(
        "Pipeline '{}': {} stages, {} samples, root {}",
        pipeline.name,
        pipeline.stages.len(),
        pipeline.manifest.len(),
        pipeline.layout.root().display()
    );

    for (level, layer) in pipeline.graph.layers()?.iter().enumerate() {
        println!();
        println!("Layer {}:", level + 1);
        for id in layer {
            let Some(stage) = pipeline.stage(id.as_str()) else {
                continue;
            };
            let present = stage
                .definition
                .output_names()
                .all(|name| pipeline.store.exists(name));
            let marker = if present { "skip" } else { "run " };
            println!("  [{}] {}", marker, id);
            println!("         {}", stage.command.command_line());
        }
    }

    let missing: Vec<_> = pipeline
        .store
        .sources()
        .filter(|source| !source.path.exists())
        .collect();
    if !missing.is_empty() {
        println!();
        println!("Missing inputs:");
        for source in missing {
            println!("  {} ({})", source.name, source.path.display());
        }
    }

    Ok(0)
}

fn show_status(cli: &Cli, logger: &Logger, pipeline: &Path) -> Result<i32> {
    let config = load_config(cli, pipeline)?;
    let history = RunHistory::new(config.history_path(), config.runner.max_history)
        .context("Failed to load history")?;

    match history.last_entry() {
        Some(entry) => {
            if entry.success.is_none() {
                logger.warn("The latest run did not finish");
            }
            RunReport::from_entry(entry.clone()).render(logger);
        }
        None => logger.info("No runs recorded yet."),
    }

    Ok(0)
}

fn show_history(cli: &Cli, logger: &Logger, pipeline: &Path, count: Option<usize>) -> Result<i32> {
    let config = load_config(cli, pipeline)?;
    let history = RunHistory::new(config.history_path(), config.runner.max_history)
        .context("Failed to load history")?;

    let entries = history.entries();
    if entries.is_empty() {
        logger.info("No run history found.");
        return Ok(0);
    }

    let count = count.unwrap_or(10).min(entries.len());
    logger.info(&format!("Run history (last {} entries):", count));

    for entry in entries.iter().rev().take(count) {
        let status = match entry.success {
            Some(true) => "✓",
            Some(false) => "✗",
            None => "…",
        };
        let duration = entry
            .duration_secs()
            .map(|secs| format!("{:.1}s", secs))
            .unwrap_or_else(|| "-".to_string());

        logger.info(&format!(
            "{} {} | {} | {} | {} succeeded, {} skipped, {} failed",
            status,
            entry.started_at.format("%Y-%m-%d %H:%M:%S"),
            entry.pipeline,
            duration,
            entry.count(StageStatus::Succeeded),
            entry.count(StageStatus::Skipped),
            entry.count(StageStatus::Failed),
        ));
    }

    Ok(0)
}

fn clear_history(cli: &Cli, pipeline: &Path) -> Result<i32> {
    let config = load_config(cli, pipeline)?;
    let mut history = RunHistory::new(config.history_path(), config.runner.max_history)
        .context("Failed to load history")?;
    history.clear()?;
    println!("Run history cleared.");
    Ok(0)
}

fn init_project(cli: &Cli, name: Option<String>, reference_db: Option<String>) -> Result<i32> {
    let project_dir = cli
        .project_directory()
        .context("Failed to determine project directory")?;
    let config_path = project_dir.join("pipeline.toml");

    if config_path.exists() {
        return Err(PipelineError::config(
            &config_path,
            "pipeline.toml already exists. Remove it first if you want to reinitialize.",
        )
        .into());
    }

    let mut config = PipelineConfig::preset()?;
    if let Some(name) = name {
        config.pipeline.name = name;
    }
    if let Some(db) = reference_db {
        config.pipeline.reference_db = db;
    }

    std::fs::create_dir_all(&project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;
    config
        .save_to_file(&config_path)
        .context("Failed to save pipeline.toml")?;
    println!("Created {}", config_path.display());

    let manifest_path = project_dir.join(&config.pipeline.manifest);
    if !manifest_path.exists() {
        std::fs::write(&manifest_path, SampleManifest::template())
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
        println!("Created {}", manifest_path.display());
    }

    let layout = ProjectLayout::new(project_dir, &config.pipeline.reference_db);
    for dir in layout.scaffold()? {
        println!("Created {}", dir.display());
    }

    Ok(0)
}

async fn dispatch(cli: &Cli, logger: Arc<Logger>) -> Result<i32> {
    match &cli.command {
        Commands::Run {
            pipeline,
            max_parallel,
            timeout,
            rerun,
        } => run_pipeline(cli, logger, pipeline, *max_parallel, *timeout, rerun).await,
        Commands::Plan { pipeline } => plan_pipeline(cli, pipeline),
        Commands::Status { pipeline } => show_status(cli, &logger, pipeline),
        Commands::History { command } => match command {
            HistoryCommands::Show { pipeline, count } => {
                show_history(cli, &logger, pipeline, *count)
            }
            HistoryCommands::Clear { pipeline } => clear_history(cli, pipeline),
        },
        Commands::Init { name, reference_db } => {
            init_project(cli, name.clone(), reference_db.clone())
        }
    }
}

/// Library errors carry their own exit code; anything else is internal.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(70)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let logger = Arc::new(Logger::new().with_verbose(cli.verbose));

    let code = match dispatch(&cli, logger.clone()).await {
        Ok(code) => code,
        Err(err) => {
            logger.error(&format!("{:#}", err));
            exit_code(&err)
        }
    };

    std::process::exit(code);
}
