use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::artifact::{default_file_name, sanitize, ArtifactKind, ArtifactStore};
use crate::command::{expand_wildcard, is_wildcard, render_path, TemplateContext, ToolCommand};
use crate::config::{to_parameter_map, Foreach, PipelineConfig, StageConfig};
use crate::dependency_graph::PipelineGraph;
use crate::errors::PipelineError;
use crate::layout::ProjectLayout;
use crate::manifest::{Sample, SampleManifest};
use crate::params::{ParameterOverrides, ParameterSet};
use crate::stage::{OutputSpec, StageDefinition, StageId, StageSet};

/// A stage with everything resolved: command line, log file, timeout.
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub definition: StageDefinition,
    pub command: ToolCommand,
    pub log_path: PathBuf,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    /// SHA-256 of the parameters the command references.
    pub fingerprint: String,
    /// Declaration indices of the stages this one consumes from.
    pub dependencies: Vec<usize>,
}

impl PlannedStage {
    pub fn id(&self) -> &StageId {
        &self.definition.id
    }

    pub fn output_names(&self) -> Vec<String> {
        self.definition.output_names().map(str::to_string).collect()
    }
}

/// A fully validated pipeline, ready to run.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub layout: ProjectLayout,
    pub manifest: SampleManifest,
    pub params: ParameterSet,
    pub stages: Vec<PlannedStage>,
    /// Declaration indices in execution order.
    pub order: Vec<usize>,
    pub graph: PipelineGraph,
    pub store: ArtifactStore,
    pub state_dir: PathBuf,
    pub max_parallel: usize,
    pub max_history: usize,
}

impl Pipeline {
    pub fn stage(&self, id: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|stage| stage.id().as_str() == id)
    }

    pub fn ordered(&self) -> impl Iterator<Item = &PlannedStage> {
        self.order.iter().map(|&idx| &self.stages[idx])
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.json")
    }

    /// Every external artifact must be on disk before anything runs.
    pub fn check_sources(&self) -> Result<(), PipelineError> {
        for source in self.store.sources() {
            if !source.path.exists() {
                return Err(PipelineError::MissingInput {
                    name: source.name.clone(),
                    path: source.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Stage indices matching `name`: an exact id, or the base id of a
    /// per-sample stage (`trim` selects `trim[20]`, `trim[60]`, ...).
    pub fn select(&self, name: &str) -> Vec<usize> {
        let prefix = format!("{}[", name);
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| {
                let id = stage.id().as_str();
                id == name || (id.starts_with(&prefix) && id.ends_with(']'))
            })
            .map(|(idx, _)| idx)
            .collect()
    }
}

pub struct PipelineBuilder<'a> {
    config: &'a PipelineConfig,
    manifest: SampleManifest,
    params: ParameterSet,
    timeout: Option<Duration>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(config: &'a PipelineConfig, manifest: SampleManifest) -> Result<Self, PipelineError> {
        Ok(Self {
            params: config.parameter_set()?,
            timeout: config.runner.timeout(),
            config,
            manifest,
        })
    }

    pub fn with_overrides(mut self, overrides: &ParameterOverrides) -> Result<Self, PipelineError> {
        if !overrides.is_empty() {
            self.params = self.params.with_overrides(overrides)?;
        }
        Ok(self)
    }

    /// Runner-wide timeout for stages without their own.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.timeout = timeout;
        }
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let layout = ProjectLayout::new(self.config.root_dir(), &self.config.pipeline.reference_db);
        let mut store = ArtifactStore::new(layout.output_dir());

        self.register_sources(&layout, &mut store)?;

        let mut definitions = Vec::new();
        for stage in &self.config.stages {
            match stage.foreach {
                Some(Foreach::Sample) => {
                    for sample in self.manifest.samples() {
                        definitions.push(self.definition(stage, Some(sample), &layout)?);
                    }
                }
                None => definitions.push(self.definition(stage, None, &layout)?),
            }
        }

        let sources: Vec<String> = store.sources().map(|a| a.name.clone()).collect();
        let set = StageSet::new(definitions, &sources)?;
        let graph = PipelineGraph::from_stage_set(&set);
        let order = graph.topological_indices()?;

        for stage in set.stages() {
            self.reserve_outputs(stage, &layout, &mut store)?;
        }

        let exclude = &self.config.runner.fingerprint_exclude;
        let mut stages = Vec::with_capacity(set.len());
        let mut log_owners: HashMap<PathBuf, &StageId> = HashMap::new();

        for (idx, stage) in set.stages().iter().enumerate() {
            let params = self.params.layered(&stage.params);
            let ctx = TemplateContext {
                stage,
                params: &params,
                store: &store,
                layout: &layout,
                manifest: &self.manifest,
            };
            let (command, used) = ctx.render_command()?;

            let working_dir = match &stage.working_dir {
                Some(template) => render_path(template, &layout, &self.manifest).map_err(|key| {
                    PipelineError::invalid_stage(
                        stage.id.as_str(),
                        format!("unknown placeholder '{}' in working_dir", key),
                    )
                })?,
                None => layout.root().to_path_buf(),
            };

            let log_path = layout
                .log_dir()
                .join(format!("{}.log", sanitize(stage.id.as_str())));
            if let Some(first) = log_owners.insert(log_path.clone(), &stage.id) {
                return Err(PipelineError::ArtifactCollision {
                    path: log_path,
                    first: first.to_string(),
                    second: stage.id.to_string(),
                });
            }

            stages.push(PlannedStage {
                command,
                log_path,
                working_dir,
                timeout: stage.timeout.or(self.timeout),
                fingerprint: params.fingerprint(used.iter(), exclude),
                dependencies: graph.dependency_indices(idx),
                definition: stage.clone(),
            });
        }

        Ok(Pipeline {
            name: self.config.pipeline.name.clone(),
            state_dir: self.config.state_dir(),
            max_parallel: self.config.runner.max_parallel,
            max_history: self.config.runner.max_history,
            layout,
            manifest: self.manifest,
            params: self.params,
            stages,
            order,
            graph,
            store,
        })
    }

    fn register_sources(
        &self,
        layout: &ProjectLayout,
        store: &mut ArtifactStore,
    ) -> Result<(), PipelineError> {
        for sample in self.manifest.samples() {
            store.register_source(
                &format!("raw-forward[{}]", sample.id),
                ArtifactKind::RawReads,
                sample.forward.clone(),
            )?;
            store.register_source(
                &format!("raw-reverse[{}]", sample.id),
                ArtifactKind::RawReads,
                sample.reverse.clone(),
            )?;
        }

        for source in &self.config.sources {
            let path = render_path(&source.path, layout, &self.manifest).map_err(|key| {
                PipelineError::config(
                    &self.config.origin,
                    format!("source '{}': unknown placeholder '{}'", source.name, key),
                )
            })?;
            store.register_source(&source.name, source.kind, path)?;
        }

        Ok(())
    }

    fn definition(
        &self,
        config: &StageConfig,
        sample: Option<&Sample>,
        layout: &ProjectLayout,
    ) -> Result<StageDefinition, PipelineError> {
        let subst = |text: &str| match sample {
            Some(sample) => substitute_sample(text, sample),
            None => text.to_string(),
        };

        let id = match sample {
            Some(sample) => format!("{}[{}]", config.id, sample.id),
            None => config.id.clone(),
        };

        let inputs = config
            .inputs
            .iter()
            .flat_map(|input| expand_wildcard(&subst(input), &self.manifest))
            .collect();

        let mut outputs = Vec::new();
        for output in &config.outputs {
            let name = subst(&output.name);
            let path = output.path.as_deref().map(subst);

            if is_wildcard(&name) {
                for (expanded, sample) in expand_wildcard(&name, &self.manifest)
                    .into_iter()
                    .zip(self.manifest.samples())
                {
                    outputs.push(OutputSpec {
                        name: expanded,
                        kind: output.kind,
                        path: path.as_deref().map(|p| substitute_sample(p, sample)),
                    });
                }
            } else {
                outputs.push(OutputSpec {
                    name,
                    kind: output.kind,
                    path,
                });
            }
        }

        let local = to_parameter_map(&config.params).map_err(|key| {
            PipelineError::config(
                &self.config.origin,
                format!("stage '{}': parameter '{}' must be a scalar value", id, key),
            )
        })?;

        let mut definition = StageDefinition::new(id, subst(&config.tool), inputs, outputs)?
            .with_args(config.args.iter().map(|arg| subst(arg)).collect())
            .with_params(ParameterSet::new(local))
            .with_timeout(config.timeout())
            .with_working_dir(config.working_dir.as_deref().map(subst));

        if let Some(description) = &config.description {
            definition = definition.with_description(subst(description));
        }

        if let Some(section) = &config.section {
            if layout.section_dir(section).is_none() {
                return Err(PipelineError::invalid_stage(
                    definition.id.as_str(),
                    format!(
                        "unknown section '{}' (expected one of: {})",
                        section,
                        ProjectLayout::section_names().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
            definition = definition.with_section(section.clone());
        }

        if let Some(sample) = sample {
            definition = definition.for_sample(sample.id.clone());
        }

        Ok(definition)
    }

    /// Explicit path template, else the stage's section directory, else the store default.
    fn reserve_outputs(
        &self,
        stage: &StageDefinition,
        layout: &ProjectLayout,
        store: &mut ArtifactStore,
    ) -> Result<(), PipelineError> {
        for output in &stage.outputs {
            if let Some(template) = &output.path {
                let path = render_path(template, layout, &self.manifest).map_err(|key| {
                    PipelineError::invalid_stage(
                        stage.id.as_str(),
                        format!("unknown placeholder '{}' in path of '{}'", key, output.name),
                    )
                })?;
                store.reserve_at(&stage.id, &output.name, output.kind, path)?;
                continue;
            }

            match stage.section.as_deref().and_then(|s| layout.section_dir(s)) {
                Some(dir) => {
                    let path = dir.join(default_file_name(&output.name, output.kind));
                    store.reserve_at(&stage.id, &output.name, output.kind, path)?;
                }
                None => {
                    store.reserve(&stage.id, &output.name, output.kind)?;
                }
            }
        }
        Ok(())
    }
}

fn substitute_sample(text: &str, sample: &Sample) -> String {
    text.replace("{sample.forward_name}", &sample.forward_name())
        .replace("{sample.reverse_name}", &sample.reverse_name())
        .replace("{sample}", &sample.id)
}
