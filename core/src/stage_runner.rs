use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::task::JoinSet;

use crate::builder::Pipeline;
use crate::errors::{FailureClass, PipelineError};
use crate::executor::{Invocation, InvocationOutcome, ToolInvoker};
use crate::history::{RunHistory, RunHistoryEntry, RunRecord, StageStatus};
use crate::logger::Logger;
use crate::monitor::ResourceMonitor;
use crate::parser::LogLevel;
use crate::report::RunReport;

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Overrides the pipeline's `max_parallel`.
    pub max_parallel: Option<usize>,
    /// Stages that run even when their outputs exist.
    pub rerun: Vec<String>,
}

type StageResult = (usize, Result<InvocationOutcome, PipelineError>);

/// Executes a built pipeline: skips stages whose outputs exist, runs the rest
/// in dependency order and stops dispatching after the first failure.
pub struct PipelineRunner {
    invoker: Arc<dyn ToolInvoker>,
    logger: Arc<Logger>,
    monitor: Option<ResourceMonitor>,
    options: RunnerOptions,
}

impl PipelineRunner {
    pub fn new(invoker: Arc<dyn ToolInvoker>, logger: Arc<Logger>) -> Self {
        Self {
            invoker,
            logger,
            monitor: None,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn rerun_set(&self, pipeline: &Pipeline) -> Result<HashSet<usize>, PipelineError> {
        let mut selected = HashSet::new();
        for name in &self.options.rerun {
            let matches = pipeline.select(name);
            if matches.is_empty() {
                return Err(PipelineError::config(
                    "--rerun",
                    format!("unknown stage '{}'", name),
                ));
            }
            selected.extend(matches);
        }
        Ok(selected)
    }

    pub async fn run(&self, pipeline: &mut Pipeline) -> anyhow::Result<RunReport> {
        let rerun = self.rerun_set(pipeline)?;
        pipeline.check_sources()?;
        pipeline.layout.scaffold()?;

        let mut history = RunHistory::new(pipeline.history_path(), pipeline.max_history)?;
        let previous: HashMap<String, String> = pipeline
            .stages
            .iter()
            .filter_map(|stage| {
                history
                    .last_success(stage.id().as_str())
                    .map(|record| (stage.id().to_string(), record.fingerprint.clone()))
            })
            .collect();

        let records = pipeline
            .stages
            .iter()
            .map(|stage| {
                RunRecord::new(
                    stage.id().as_str(),
                    stage.command.program.clone(),
                    stage.command.command_line(),
                    stage.log_path.clone(),
                    stage.fingerprint.clone(),
                )
            })
            .collect();
        let mut entry = RunHistoryEntry::new(&pipeline.name, records);
        history.upsert(&entry)?;

        let max_parallel = self
            .options
            .max_parallel
            .unwrap_or(pipeline.max_parallel)
            .max(1);

        self.logger.info(&format!(
            "Running '{}': {} stages, {} samples, up to {} in parallel",
            pipeline.name,
            pipeline.stages.len(),
            pipeline.manifest.len(),
            max_parallel
        ));

        let monitor_task = self.monitor.as_ref().map(|m| m.start_monitoring());

        let mut status = vec![StageStatus::Pending; pipeline.stages.len()];
        let mut pending: Vec<usize> = pipeline.order.clone();
        let mut running: JoinSet<StageResult> = JoinSet::new();
        let mut failure: Option<FailureClass> = None;

        loop {
            if failure.is_none() {
                let mut i = 0;
                while i < pending.len() && running.len() < max_parallel {
                    let idx = pending[i];
                    let ready = pipeline.stages[idx]
                        .dependencies
                        .iter()
                        .all(|&dep| status[dep].is_done());
                    if !ready {
                        i += 1;
                        continue;
                    }
                    pending.remove(i);

                    if !rerun.contains(&idx) && self.outputs_present(pipeline, idx) {
                        self.skip(pipeline, idx, &previous, &mut entry);
                        for name in pipeline.stages[idx].output_names() {
                            pipeline.store.record_produced(&name);
                        }
                        status[idx] = StageStatus::Skipped;
                        history.upsert(&entry)?;
                        continue;
                    }

                    match self.dispatch(pipeline, idx, &mut running) {
                        Ok(()) => {
                            status[idx] = StageStatus::Running;
                            entry.records[idx].start();
                        }
                        Err(err) => {
                            status[idx] = StageStatus::Failed;
                            failure = Some(err.class());
                            self.fail(pipeline, idx, err, &mut entry);
                        }
                    }
                    history.upsert(&entry)?;

                    if failure.is_some() {
                        break;
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (idx, result) = joined.map_err(|err| anyhow!("stage task panicked: {}", err))?;

            let result = result.and_then(|outcome| self.verify_outputs(pipeline, idx, outcome));
            match result {
                Ok(outcome) => {
                    let record = &mut entry.records[idx];
                    record.exit_code = Some(outcome.exit_code);
                    record.duration_ms = Some(outcome.duration_ms);
                    record.finish(StageStatus::Succeeded);
                    status[idx] = StageStatus::Succeeded;

                    for name in pipeline.stages[idx].output_names() {
                        pipeline.store.record_produced(&name);
                    }
                    self.logger.stage(
                        LogLevel::Info,
                        pipeline.stages[idx].id().as_str(),
                        &format!("succeeded in {:.1}s", outcome.duration_ms as f64 / 1000.0),
                    );
                }
                Err(err) => {
                    status[idx] = StageStatus::Failed;
                    if failure.is_none() {
                        failure = Some(err.class());
                        if !running.is_empty() {
                            self.logger.warn(&format!(
                                "Waiting for {} running stage(s) before stopping",
                                running.len()
                            ));
                        }
                    }
                    self.fail(pipeline, idx, err, &mut entry);
                }
            }
            history.upsert(&entry)?;
        }

        for idx in pending {
            entry.records[idx].status = StageStatus::NotStarted;
        }

        if let Some(task) = monitor_task {
            task.abort();
        }
        let resources = self.monitor.as_ref().map(ResourceMonitor::get_stats);
        entry.finalize(resources);
        history.upsert(&entry)?;

        Ok(RunReport::new(entry, failure))
    }

    fn outputs_present(&self, pipeline: &Pipeline, idx: usize) -> bool {
        pipeline.stages[idx]
            .definition
            .output_names()
            .all(|name| pipeline.store.exists(name))
    }

    fn skip(
        &self,
        pipeline: &Pipeline,
        idx: usize,
        previous: &HashMap<String, String>,
        entry: &mut RunHistoryEntry,
    ) {
        let stage = &pipeline.stages[idx];
        let id = stage.id().as_str();
        let record = &mut entry.records[idx];
        record.finish(StageStatus::Skipped);

        match previous.get(id) {
            Some(fingerprint) if fingerprint != &stage.fingerprint => {
                record.stale = true;
                self.logger.stage(
                    LogLevel::Warning,
                    id,
                    &format!(
                        "outputs exist but were produced with different parameters; use --rerun {} to rebuild",
                        id
                    ),
                );
            }
            _ => self.logger.stage(LogLevel::Info, id, "skipped, outputs present"),
        }
    }

    fn dispatch(
        &self,
        pipeline: &Pipeline,
        idx: usize,
        running: &mut JoinSet<StageResult>,
    ) -> Result<(), PipelineError> {
        let stage = &pipeline.stages[idx];
        pipeline.store.prepare(&stage.output_names())?;
        let invocation = Invocation::for_stage(stage, &pipeline.store)?;

        self.logger.stage(
            LogLevel::Info,
            stage.id().as_str(),
            &format!("started: {}", stage.definition.description),
        );
        self.logger.stage(
            LogLevel::Debug,
            stage.id().as_str(),
            &invocation.command_line(),
        );

        let invoker = Arc::clone(&self.invoker);
        running.spawn(async move {
            let result = invoker.invoke(&invocation).await;
            (idx, result)
        });
        Ok(())
    }

    fn verify_outputs(
        &self,
        pipeline: &Pipeline,
        idx: usize,
        outcome: InvocationOutcome,
    ) -> Result<InvocationOutcome, PipelineError> {
        let stage = &pipeline.stages[idx];
        for name in stage.definition.output_names() {
            if !pipeline.store.exists(name) {
                return Err(PipelineError::MissingOutput {
                    stage: stage.id().to_string(),
                    artifact: name.to_string(),
                    path: pipeline.store.resolve(name)?.to_path_buf(),
                });
            }
        }
        Ok(outcome)
    }

    fn fail(&self, pipeline: &Pipeline, idx: usize, err: PipelineError, entry: &mut RunHistoryEntry) {
        let id = pipeline.stages[idx].id().as_str();
        let record = &mut entry.records[idx];

        if let PipelineError::ToolFailure { exit_code, .. } = &err {
            record.exit_code = *exit_code;
        }
        if let Some((_, tail)) = err.tool_context() {
            record.log_excerpt = tail.to_vec();
        }
        record.error = Some(err.to_string());
        record.finish(StageStatus::Failed);

        self.logger.stage(LogLevel::Error, id, &err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PipelineBuilder;
    use crate::config::PipelineConfig;
    use crate::manifest::{Sample, SampleManifest};
    use crate::params::ParameterOverrides;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records calls and writes every expected output, unless told otherwise.
    #[derive(Default)]
    struct FakeInvoker {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
        no_output: HashSet<String>,
        slow: HashSet<String>,
    }

    impl FakeInvoker {
        fn failing(stage: &str) -> Self {
            Self {
                fail: [stage.to_string()].into_iter().collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn invoke(&self, invocation: &Invocation) -> Result<InvocationOutcome, PipelineError> {
            let stage = invocation.stage.to_string();
            self.calls.lock().unwrap().push(stage.clone());

            if self.slow.contains(&stage) {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            }

            if self.fail.contains(&stage) {
                return Err(PipelineError::ToolFailure {
                    stage,
                    command: invocation.program.clone(),
                    args: invocation.args.clone(),
                    exit_code: Some(1),
                    log_tail: vec!["Error: simulated failure".to_string()],
                });
            }

            if !self.no_output.contains(&stage) {
                for path in &invocation.expected_outputs {
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, "ok").unwrap();
                }
            }

            Ok(InvocationOutcome {
                exit_code: 0,
                duration_ms: 1,
            })
        }
    }

    const CHAIN: &str = r#"
[pipeline]
name = "chain"

[parameters]
threads = 4
trunc_len_f = 260

[[stages]]
id = "a"
tool = "tool-a"
inputs = ["raw-forward[*]"]
outputs = [{ name = "a-out", kind = "report" }]
args = ["--threads", "{threads}", "{in:raw-forward[*]}", "{out:a-out}"]

[[stages]]
id = "b"
tool = "tool-b"
inputs = ["a-out"]
outputs = [{ name = "b-out", kind = "feature-table" }]
args = ["--trunc", "{trunc_len_f}", "{in:a-out}", "{out:b-out}"]

[[stages]]
id = "c"
tool = "tool-c"
inputs = ["b-out"]
outputs = [{ name = "c-out", kind = "visualization" }]
args = ["{in:b-out}", "{out:c-out}"]
"#;

    const INDEPENDENT: &str = r#"
[pipeline]
name = "independent"

[[stages]]
id = "y"
tool = "tool-y"
outputs = [{ name = "y-out", kind = "report" }]
args = ["{out:y-out}"]

[[stages]]
id = "x"
tool = "tool-x"
outputs = [{ name = "x-out", kind = "report" }]
args = ["{out:x-out}"]

[[stages]]
id = "z"
tool = "tool-z"
outputs = [{ name = "z-out", kind = "report" }]
args = ["{out:z-out}"]
"#;

    const PER_SAMPLE: &str = r#"
[pipeline]
name = "per-sample"

[parameters]
threads = 4

[[stages]]
id = "import"
foreach = "sample"
tool = "qiime"
inputs = ["raw-forward[{sample}]", "raw-reverse[{sample}]"]
outputs = [{ name = "demux[{sample}]", kind = "sequence-set", path = "{dir:import}/{sample}.qza" }]
args = ["--threads", "{threads}", "{in:raw-forward[{sample}]}", "{in:raw-reverse[{sample}]}", "{out:demux[{sample}]}"]

[[stages]]
id = "merge"
tool = "qiime"
inputs = ["demux[*]"]
outputs = [{ name = "demux", kind = "sequence-set" }]
args = ["--threads", "{threads}", "{in:demux[*]}", "{out:demux}"]
"#;

    fn project(ids: &[&str]) -> (tempfile::TempDir, SampleManifest) {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw_data");
        std::fs::create_dir_all(&raw).unwrap();

        let samples = ids
            .iter()
            .map(|id| {
                let forward = raw.join(format!("{id}_R1.fastq.gz"));
                let reverse = raw.join(format!("{id}_R2.fastq.gz"));
                std::fs::write(&forward, "").unwrap();
                std::fs::write(&reverse, "").unwrap();
                Sample {
                    id: id.to_string(),
                    forward,
                    reverse,
                }
            })
            .collect();
        let manifest = SampleManifest::new(dir.path().join("manifest.tsv"), samples);
        (dir, manifest)
    }

    fn build(content: &str, root: &Path, manifest: &SampleManifest, set: &[&str]) -> Pipeline {
        let config = PipelineConfig::parse(content, &root.join("pipeline.toml"), root).unwrap();
        let overrides = ParameterOverrides::default()
            .with_assignments(&set.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .unwrap();
        PipelineBuilder::new(&config, manifest.clone())
            .unwrap()
            .with_overrides(&overrides)
            .unwrap()
            .build()
            .unwrap()
    }

    async fn run_with(
        invoker: Arc<FakeInvoker>,
        pipeline: &mut Pipeline,
        options: RunnerOptions,
    ) -> RunReport {
        PipelineRunner::new(invoker, Arc::new(Logger::plain()))
            .with_options(options)
            .run(pipeline)
            .await
            .unwrap()
    }

    fn statuses(report: &RunReport) -> Vec<(String, StageStatus)> {
        report
            .entry
            .records
            .iter()
            .map(|r| (r.stage.clone(), r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_second_run_invokes_nothing() {
        let (dir, manifest) = project(&["s1"]);

        let first = Arc::new(FakeInvoker::default());
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);
        let report = run_with(first.clone(), &mut pipeline, RunnerOptions::default()).await;
        assert_eq!(first.calls(), vec!["a", "b", "c"]);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(StageStatus::Succeeded), 3);

        let second = Arc::new(FakeInvoker::default());
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);
        let report = run_with(second.clone(), &mut pipeline, RunnerOptions::default()).await;
        assert!(second.calls().is_empty());
        assert_eq!(report.count(StageStatus::Skipped), 3);
        assert!(report.succeeded());

        let history =
            RunHistory::new(dir.path().join("pipeline_output/.ampliflow/history.json"), 20)
                .unwrap();
        assert_eq!(history.entries().len(), 2);
        assert_eq!(history.entries()[0].success, Some(true));
    }

    #[tokio::test]
    async fn test_existing_outputs_are_skipped() {
        let (dir, manifest) = project(&["s1"]);
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);

        let a_out = pipeline.store.resolve("a-out").unwrap().to_path_buf();
        std::fs::create_dir_all(a_out.parent().unwrap()).unwrap();
        std::fs::write(&a_out, "made earlier").unwrap();

        let invoker = Arc::new(FakeInvoker::default());
        let report = run_with(invoker.clone(), &mut pipeline, RunnerOptions::default()).await;

        assert_eq!(invoker.calls(), vec!["b", "c"]);
        assert_eq!(report.record("a").unwrap().status, StageStatus::Skipped);
        assert_eq!(std::fs::read_to_string(&a_out).unwrap(), "made earlier");
    }

    #[tokio::test]
    async fn test_failure_stops_downstream_stages() {
        let (dir, manifest) = project(&["s1"]);
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);

        let invoker = Arc::new(FakeInvoker::failing("b"));
        let report = run_with(invoker.clone(), &mut pipeline, RunnerOptions::default()).await;

        assert_eq!(invoker.calls(), vec!["a", "b"]);
        assert_eq!(
            statuses(&report),
            vec![
                ("a".to_string(), StageStatus::Succeeded),
                ("b".to_string(), StageStatus::Failed),
                ("c".to_string(), StageStatus::NotStarted),
            ]
        );
        assert_eq!(report.count(StageStatus::Failed), 1);
        assert_eq!(report.count(StageStatus::NotStarted), 1);
        assert_eq!(report.exit_code(), 4);

        let failed = report.record("b").unwrap();
        assert_eq!(failed.exit_code, Some(1));
        assert_eq!(failed.log_excerpt, vec!["Error: simulated failure"]);
        assert!(failed.command.starts_with("tool-b --trunc 260"));
        assert_eq!(report.entry.success, Some(false));
    }

    #[tokio::test]
    async fn test_failure_lets_running_siblings_finish() {
        let (dir, manifest) = project(&["s1"]);
        let mut pipeline = build(INDEPENDENT, dir.path(), &manifest, &[]);

        let invoker = Arc::new(FakeInvoker {
            fail: ["x".to_string()].into_iter().collect(),
            slow: ["y".to_string()].into_iter().collect(),
            ..FakeInvoker::default()
        });
        let options = RunnerOptions {
            max_parallel: Some(2),
            ..RunnerOptions::default()
        };
        let report = run_with(invoker.clone(), &mut pipeline, options).await;

        assert_eq!(invoker.calls(), vec!["y", "x"]);
        assert_eq!(
            statuses(&report),
            vec![
                ("y".to_string(), StageStatus::Succeeded),
                ("x".to_string(), StageStatus::Failed),
                ("z".to_string(), StageStatus::NotStarted),
            ]
        );
        assert!(pipeline.store.exists("y-out"));
        assert!(!pipeline.store.exists("z-out"));
        assert_eq!(report.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_missing_output_is_a_failure() {
        let (dir, manifest) = project(&["s1"]);
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);

        let invoker = Arc::new(FakeInvoker {
            no_output: ["a".to_string()].into_iter().collect(),
            ..FakeInvoker::default()
        });
        let report = run_with(invoker.clone(), &mut pipeline, RunnerOptions::default()).await;

        assert_eq!(invoker.calls(), vec!["a"]);
        let record = report.record("a").unwrap();
        assert_eq!(record.status, StageStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("did not produce 'a-out'"));
        assert_eq!(report.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_threads_change_reinvokes_nothing() {
        let (dir, manifest) = project(&["20", "60", "100"]);

        let first = Arc::new(FakeInvoker::default());
        let mut pipeline = build(PER_SAMPLE, dir.path(), &manifest, &["threads=4"]);
        run_with(first.clone(), &mut pipeline, RunnerOptions::default()).await;
        assert_eq!(
            first.calls(),
            vec!["import[20]", "import[60]", "import[100]", "merge"]
        );

        let second = Arc::new(FakeInvoker::default());
        let mut pipeline = build(PER_SAMPLE, dir.path(), &manifest, &["threads=8"]);
        let report = run_with(second.clone(), &mut pipeline, RunnerOptions::default()).await;
        assert!(second.calls().is_empty());
        assert!(report.entry.records.iter().all(|r| !r.stale));
    }

    #[tokio::test]
    async fn test_parameter_change_marks_skip_as_stale() {
        let (dir, manifest) = project(&["s1"]);

        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);
        run_with(Arc::new(FakeInvoker::default()), &mut pipeline, RunnerOptions::default()).await;

        let invoker = Arc::new(FakeInvoker::default());
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &["trunc_len_f=240"]);
        let report = run_with(invoker.clone(), &mut pipeline, RunnerOptions::default()).await;

        assert!(invoker.calls().is_empty());
        assert!(report.record("b").unwrap().stale);
        assert!(!report.record("a").unwrap().stale);
    }

    #[tokio::test]
    async fn test_rerun_forces_named_stage() {
        let (dir, manifest) = project(&["20", "60"]);

        let mut pipeline = build(PER_SAMPLE, dir.path(), &manifest, &[]);
        run_with(Arc::new(FakeInvoker::default()), &mut pipeline, RunnerOptions::default()).await;

        let invoker = Arc::new(FakeInvoker::default());
        let mut pipeline = build(PER_SAMPLE, dir.path(), &manifest, &[]);
        let options = RunnerOptions {
            rerun: vec!["import".to_string()],
            ..RunnerOptions::default()
        };
        run_with(invoker.clone(), &mut pipeline, options).await;
        assert_eq!(invoker.calls(), vec!["import[20]", "import[60]"]);
    }

    #[tokio::test]
    async fn test_unknown_rerun_stage_is_a_configuration_error() {
        let (dir, manifest) = project(&["s1"]);
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);

        let err = PipelineRunner::new(Arc::new(FakeInvoker::default()), Arc::new(Logger::plain()))
            .with_options(RunnerOptions {
                rerun: vec!["denoise".to_string()],
                ..RunnerOptions::default()
            })
            .run(&mut pipeline)
            .await
            .unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_missing_raw_reads_stop_before_running() {
        let (dir, manifest) = project(&["s1"]);
        std::fs::remove_file(&manifest.samples()[0].forward).unwrap();
        let mut pipeline = build(CHAIN, dir.path(), &manifest, &[]);

        let invoker = Arc::new(FakeInvoker::default());
        let err = PipelineRunner::new(invoker.clone(), Arc::new(Logger::plain()))
            .run(&mut pipeline)
            .await
            .unwrap_err();

        assert!(invoker.calls().is_empty());
        assert_eq!(err.downcast::<PipelineError>().unwrap().exit_code(), 3);
    }

    #[tokio::test]
    async fn test_parallel_run_completes_every_sample() {
        let (dir, manifest) = project(&["20", "60", "100"]);
        let mut pipeline = build(PER_SAMPLE, dir.path(), &manifest, &[]);

        let invoker = Arc::new(FakeInvoker::default());
        let options = RunnerOptions {
            max_parallel: Some(3),
            ..RunnerOptions::default()
        };
        let report = run_with(invoker.clone(), &mut pipeline, options).await;

        let calls = invoker.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last().map(String::as_str), Some("merge"));
        assert_eq!(report.count(StageStatus::Succeeded), 4);
        assert!(pipeline.store.produced("demux"));
    }
}
