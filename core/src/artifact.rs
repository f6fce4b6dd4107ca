use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::stage::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    RawReads,
    TrimmedReads,
    FeatureTable,
    SequenceSet,
    Tree,
    DistanceMatrix,
    AlphaDiversity,
    Classification,
    Visualization,
    Report,
    Reference,
    Metadata,
    Export,
}

impl ArtifactKind {
    /// Extension used for default paths. `None` means the artifact is a directory.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ArtifactKind::RawReads | ArtifactKind::TrimmedReads => Some("fastq.gz"),
            ArtifactKind::FeatureTable
            | ArtifactKind::SequenceSet
            | ArtifactKind::Tree
            | ArtifactKind::DistanceMatrix
            | ArtifactKind::AlphaDiversity
            | ArtifactKind::Classification
            | ArtifactKind::Reference => Some("qza"),
            ArtifactKind::Visualization => Some("qzv"),
            ArtifactKind::Metadata => Some("tsv"),
            ArtifactKind::Report | ArtifactKind::Export => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::RawReads => "raw-reads",
            ArtifactKind::TrimmedReads => "trimmed-reads",
            ArtifactKind::FeatureTable => "feature-table",
            ArtifactKind::SequenceSet => "sequence-set",
            ArtifactKind::Tree => "tree",
            ArtifactKind::DistanceMatrix => "distance-matrix",
            ArtifactKind::AlphaDiversity => "alpha-diversity",
            ArtifactKind::Classification => "classification",
            ArtifactKind::Visualization => "visualization",
            ArtifactKind::Report => "report",
            ArtifactKind::Reference => "reference",
            ArtifactKind::Metadata => "metadata",
            ArtifactKind::Export => "export",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Producer {
    Stage(StageId),
    External,
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::Stage(id) => write!(f, "{}", id),
            Producer::External => write!(f, "external"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub producer: Producer,
}

/// Maps logical artifact names to filesystem paths.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_root: PathBuf,
    artifacts: BTreeMap<String, Artifact>,
    claimed: HashMap<PathBuf, String>,
    produced: HashSet<String>,
}

impl ArtifactStore {
    pub fn new(output_root: PathBuf) -> Self {
        Self {
            output_root,
            artifacts: BTreeMap::new(),
            claimed: HashMap::new(),
            produced: HashSet::new(),
        }
    }

    /// Reserves the default path `<output root>/<stage>/<name>.<ext>`.
    pub fn reserve(
        &mut self,
        stage: &StageId,
        name: &str,
        kind: ArtifactKind,
    ) -> Result<PathBuf, PipelineError> {
        let path = self
            .output_root
            .join(sanitize(stage.as_str()))
            .join(default_file_name(name, kind));
        self.reserve_at(stage, name, kind, path)
    }

    pub fn reserve_at(
        &mut self,
        stage: &StageId,
        name: &str,
        kind: ArtifactKind,
        path: PathBuf,
    ) -> Result<PathBuf, PipelineError> {
        let producer = Producer::Stage(stage.clone());

        if let Some(existing) = self.artifacts.get(name) {
            if existing.producer == producer && existing.path == path {
                return Ok(existing.path.clone());
            }
            return Err(PipelineError::invalid_stage(
                stage.as_str(),
                format!("artifact '{}' is already produced by '{}'", name, existing.producer),
            ));
        }

        self.insert(name, kind, path, producer)
    }

    /// Registers an artifact that exists before the pipeline runs.
    pub fn register_source(
        &mut self,
        name: &str,
        kind: ArtifactKind,
        path: PathBuf,
    ) -> Result<PathBuf, PipelineError> {
        if let Some(existing) = self.artifacts.get(name) {
            return Err(PipelineError::invalid_stage(
                name,
                format!("source '{}' is already produced by '{}'", name, existing.producer),
            ));
        }
        self.insert(name, kind, path, Producer::External)
    }

    fn insert(
        &mut self,
        name: &str,
        kind: ArtifactKind,
        path: PathBuf,
        producer: Producer,
    ) -> Result<PathBuf, PipelineError> {
        if let Some(owner) = self.claimed.get(&path) {
            return Err(PipelineError::ArtifactCollision {
                path,
                first: owner.clone(),
                second: name.to_string(),
            });
        }

        self.claimed.insert(path.clone(), name.to_string());
        self.artifacts.insert(
            name.to_string(),
            Artifact {
                name: name.to_string(),
                kind,
                path: path.clone(),
                producer,
            },
        );
        Ok(path)
    }

    pub fn resolve(&self, name: &str) -> Result<&Path, PipelineError> {
        self.artifacts
            .get(name)
            .map(|artifact| artifact.path.as_path())
            .ok_or_else(|| PipelineError::ArtifactNotFound(name.to_string()))
    }

    pub fn sources(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .values()
            .filter(|artifact| artifact.producer == Producer::External)
    }

    /// True when the artifact is present on disk. Directories must be non-empty.
    pub fn exists(&self, name: &str) -> bool {
        let Some(artifact) = self.artifacts.get(name) else {
            return false;
        };

        let path = &artifact.path;
        if path.is_dir() {
            std::fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        } else {
            path.is_file()
        }
    }

    /// Creates parent directories for the given outputs. Outputs nested inside
    /// another listed output are skipped so tools can create that directory themselves.
    pub fn prepare<S: AsRef<str>>(&self, names: &[S]) -> Result<(), PipelineError> {
        let paths: Vec<&Path> = names
            .iter()
            .map(|name| self.resolve(name.as_ref()))
            .collect::<Result<_, _>>()?;

        for path in &paths {
            let nested = paths
                .iter()
                .any(|other| other != path && path.starts_with(other));
            if nested {
                continue;
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    PipelineError::io(format!("cannot create {}", parent.display()), err)
                })?;
            }
        }

        Ok(())
    }

    pub fn record_produced(&mut self, name: &str) {
        self.produced.insert(name.to_string());
    }

    pub fn produced(&self, name: &str) -> bool {
        self.produced.contains(name)
    }
}

pub fn default_file_name(name: &str, kind: ArtifactKind) -> String {
    let base = sanitize(name);
    match kind.extension() {
        Some(ext) => format!("{}.{}", base, ext),
        None => base,
    }
}

/// Turns `trim[20]` into `trim-20`, keeping names usable as file names.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => out.push(c),
            ']' => {}
            _ => out.push('-'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str) -> StageId {
        StageId::new(id)
    }

    #[test]
    fn test_reserve_is_deterministic() {
        let mut store = ArtifactStore::new(PathBuf::from("/out"));
        let path = store
            .reserve(&stage("denoise"), "feature-table", ArtifactKind::FeatureTable)
            .unwrap();
        assert_eq!(path, PathBuf::from("/out/denoise/feature-table.qza"));

        let again = store
            .reserve(&stage("denoise"), "feature-table", ArtifactKind::FeatureTable)
            .unwrap();
        assert_eq!(path, again);

        let mut other = ArtifactStore::new(PathBuf::from("/out"));
        let fresh = other
            .reserve(&stage("denoise"), "feature-table", ArtifactKind::FeatureTable)
            .unwrap();
        assert_eq!(path, fresh);
    }

    #[test]
    fn test_reserve_by_other_stage_fails() {
        let mut store = ArtifactStore::new(PathBuf::from("/out"));
        store
            .reserve(&stage("denoise"), "feature-table", ArtifactKind::FeatureTable)
            .unwrap();
        let err = store
            .reserve(&stage("rarefy"), "feature-table", ArtifactKind::FeatureTable)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }

    #[test]
    fn test_path_collision_is_detected() {
        let mut store = ArtifactStore::new(PathBuf::from("/out"));
        store
            .reserve_at(
                &stage("trim[20]"),
                "trimmed-forward[20]",
                ArtifactKind::TrimmedReads,
                PathBuf::from("/clean/20_R1.fastq.gz"),
            )
            .unwrap();
        let err = store
            .reserve_at(
                &stage("trim[60]"),
                "trimmed-forward[60]",
                ArtifactKind::TrimmedReads,
                PathBuf::from("/clean/20_R1.fastq.gz"),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactCollision { .. }));
    }

    #[test]
    fn test_resolve_unknown_artifact() {
        let store = ArtifactStore::new(PathBuf::from("/out"));
        assert!(matches!(
            store.resolve("rooted-tree"),
            Err(PipelineError::ArtifactNotFound(_))
        ));
        assert!(!store.exists("rooted-tree"));
    }

    #[test]
    fn test_exists_requires_content_for_directories() {
        let temp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new(temp.path().to_path_buf());
        let dir = store
            .reserve(&stage("fastqc-raw"), "fastqc-raw-reports", ArtifactKind::Report)
            .unwrap();
        assert!(!store.exists("fastqc-raw-reports"));

        std::fs::create_dir_all(&dir).unwrap();
        assert!(!store.exists("fastqc-raw-reports"));

        std::fs::write(dir.join("20_R1_fastqc.html"), "<html/>").unwrap();
        assert!(store.exists("fastqc-raw-reports"));
    }

    #[test]
    fn test_prepare_skips_nested_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new(temp.path().to_path_buf());
        let core = temp.path().join("diversity/core-metrics");
        store
            .reserve_at(&stage("core-metrics"), "core-metrics", ArtifactKind::Report, core.clone())
            .unwrap();
        store
            .reserve_at(
                &stage("core-metrics"),
                "faith-pd-vector",
                ArtifactKind::AlphaDiversity,
                core.join("faith_pd_vector.qza"),
            )
            .unwrap();

        store.prepare(&["core-metrics", "faith-pd-vector"]).unwrap();
        store.prepare(&["core-metrics", "faith-pd-vector"]).unwrap();

        assert!(temp.path().join("diversity").is_dir());
        assert!(!core.exists());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("trim[20]"), "trim-20");
        assert_eq!(sanitize("raw-forward[*]"), "raw-forward--");
        assert_eq!(sanitize("a b/c"), "a-b-c");
    }
}
