use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::ArtifactKind;
use crate::errors::PipelineError;
use crate::params::{ParamValue, ParameterSet};

const PRESET_16S: &str = include_str!("../presets/amplicon_16s.toml");

/// Pipeline definition file (`pipeline.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, toml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// File this config was read from.
    #[serde(skip)]
    pub origin: PathBuf,
    /// Relative paths resolve against this directory.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default = "default_reference_db")]
    pub reference_db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_fingerprint_exclude")]
    pub fingerprint_exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Foreach {
    Sample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<Foreach>,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, toml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout_secs: None,
            state_dir: default_state_dir(),
            max_history: default_max_history(),
            fingerprint_exclude: default_fingerprint_exclude(),
        }
    }
}

fn default_root() -> String {
    ".".to_string()
}

fn default_manifest() -> String {
    "manifest.tsv".to_string()
}

fn default_reference_db() -> String {
    "silva-138".to_string()
}

fn default_max_parallel() -> usize {
    1
}

fn default_state_dir() -> String {
    "pipeline_output/.ampliflow".to_string()
}

fn default_max_history() -> usize {
    20
}

fn default_fingerprint_exclude() -> Vec<String> {
    vec!["threads".to_string()]
}

impl RunnerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl PipelineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).to_string();
        let path = Path::new(&expanded);

        let content = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::config(path, format!("cannot read pipeline file: {}", err))
        })?;

        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::parse(&content, path, base_dir)
    }

    pub fn parse(content: &str, origin: &Path, base_dir: &Path) -> Result<Self, PipelineError> {
        let mut config: PipelineConfig =
            toml::from_str(content).map_err(|err| PipelineError::config(origin, err.to_string()))?;
        config.origin = origin.to_path_buf();
        config.base_dir = base_dir.to_path_buf();
        config.validate(origin)?;
        Ok(config)
    }

    /// The bundled 16S amplicon pipeline.
    pub fn preset() -> Result<Self, PipelineError> {
        Self::parse(PRESET_16S, Path::new("<16S preset>"), Path::new("."))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        use anyhow::Context;

        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline to TOML")?;

        std::fs::write(path.as_ref(), content).with_context(|| {
            format!("Failed to write pipeline file: {}", path.as_ref().display())
        })?;

        Ok(())
    }

    fn validate(&self, origin: &Path) -> Result<(), PipelineError> {
        if self.pipeline.name.trim().is_empty() {
            return Err(PipelineError::config(origin, "pipeline name is empty"));
        }
        if self.runner.max_parallel == 0 {
            return Err(PipelineError::config(origin, "max_parallel must be at least 1"));
        }
        if self.runner.timeout_secs == Some(0) {
            return Err(PipelineError::config(origin, "timeout_secs must be positive"));
        }

        for stage in &self.stages {
            if stage.timeout_secs == Some(0) {
                return Err(PipelineError::config(
                    origin,
                    format!("stage '{}': timeout_secs must be positive", stage.id),
                ));
            }
            to_parameter_map(&stage.params).map_err(|key| {
                PipelineError::config(
                    origin,
                    format!("stage '{}': parameter '{}' must be a scalar value", stage.id, key),
                )
            })?;
        }

        to_parameter_map(&self.parameters).map_err(|key| {
            PipelineError::config(origin, format!("parameter '{}' must be a scalar value", key))
        })?;

        Ok(())
    }

    pub fn parameter_set(&self) -> Result<ParameterSet, PipelineError> {
        to_parameter_map(&self.parameters)
            .map(ParameterSet::new)
            .map_err(|key| {
                PipelineError::config(
                    &self.origin,
                    format!("parameter '{}' must be a scalar value", key),
                )
            })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn root_dir(&self) -> PathBuf {
        self.resolve(&self.pipeline.root)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_dir().join(
            shellexpand::tilde(&self.pipeline.manifest).as_ref(),
        )
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root_dir().join(&self.runner.state_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir().join("history.json")
    }
}

/// Converts a TOML table into scalar parameters; returns the first non-scalar key.
pub fn to_parameter_map(
    table: &BTreeMap<String, toml::Value>,
) -> Result<BTreeMap<String, ParamValue>, String> {
    table
        .iter()
        .map(|(key, value)| {
            ParamValue::from_toml(value)
                .map(|value| (key.clone(), value))
                .ok_or_else(|| key.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[pipeline]
name = "mock-community"

[parameters]
threads = 4
trunc_len_f = 260
max_ee_f = 2.0
pooling_method = "independent"

[[stages]]
id = "import"
tool = "qiime"
args = ["tools", "import", "--output-path", "{out:demux}"]
outputs = [{ name = "demux", kind = "sequence-set" }]
"#;

    #[test]
    fn test_defaults() {
        let config =
            PipelineConfig::parse(MINIMAL, Path::new("pipeline.toml"), Path::new("/work")).unwrap();

        assert_eq!(config.pipeline.root, ".");
        assert_eq!(config.pipeline.reference_db, "silva-138");
        assert_eq!(config.runner.max_parallel, 1);
        assert_eq!(config.runner.timeout(), None);
        assert_eq!(config.runner.fingerprint_exclude, vec!["threads"]);
        assert_eq!(config.root_dir(), PathBuf::from("/work/."));
        assert_eq!(
            config.history_path(),
            PathBuf::from("/work/./pipeline_output/.ampliflow/history.json")
        );

        let params = config.parameter_set().unwrap();
        assert_eq!(params.len(), 4);
        assert_eq!(params.get("max_ee_f"), Some(&ParamValue::Float(2.0)));
    }

    #[test]
    fn test_nested_parameter_is_rejected() {
        let content = MINIMAL.replace("threads = 4", "threads = { value = 4 }");
        let err = PipelineConfig::parse(&content, Path::new("pipeline.toml"), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert!(err.to_string().contains("'threads'"));
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let content = format!("{}\n[runner]\nmax_parallel = 0\n", MINIMAL);
        assert!(PipelineConfig::parse(&content, Path::new("p.toml"), Path::new(".")).is_err());
    }

    #[test]
    fn test_unknown_artifact_kind_is_a_configuration_error() {
        let content = MINIMAL.replace("sequence-set", "bam");
        let err =
            PipelineConfig::parse(&content, Path::new("p.toml"), Path::new(".")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_preset_parses() {
        let preset = PipelineConfig::preset().unwrap();
        assert_eq!(preset.pipeline.name, "amplicon-16s");
        assert!(preset.stages.iter().any(|s| s.foreach == Some(Foreach::Sample)));
        assert!(preset.parameter_set().unwrap().contains("sampling_depth"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");

        let mut preset = PipelineConfig::preset().unwrap();
        preset.pipeline.name = "soil-survey".to_string();
        preset.save_to_file(&path).unwrap();

        let loaded = PipelineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.pipeline.name, "soil-survey");
        assert_eq!(loaded.stages.len(), preset.stages.len());
        assert_eq!(loaded.base_dir, dir.path());
    }
}
