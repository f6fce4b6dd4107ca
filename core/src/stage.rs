use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKind, Producer};
use crate::errors::PipelineError;
use crate::params::ParameterSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub kind: ArtifactKind,
    /// Path template; the artifact store picks a default when absent.
    pub path: Option<String>,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub id: StageId,
    pub description: String,
    pub section: Option<String>,
    pub tool: String,
    pub args: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputSpec>,
    pub params: ParameterSet,
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
    pub sample: Option<String>,
}

impl StageDefinition {
    pub fn new(
        id: impl Into<StageId>,
        tool: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<OutputSpec>,
    ) -> Result<Self, PipelineError> {
        let id = id.into();
        let tool = tool.into();

        if id.as_str().trim().is_empty() {
            return Err(PipelineError::invalid_stage("<unnamed>", "stage id is empty"));
        }
        if tool.trim().is_empty() {
            return Err(PipelineError::invalid_stage(id.as_str(), "no tool configured"));
        }
        if outputs.is_empty() {
            return Err(PipelineError::invalid_stage(
                id.as_str(),
                "a stage must produce at least one artifact",
            ));
        }

        let mut names = HashSet::new();
        for output in &outputs {
            if !names.insert(output.name.as_str()) {
                return Err(PipelineError::invalid_stage(
                    id.as_str(),
                    format!("artifact '{}' is declared twice", output.name),
                ));
            }
            if inputs.contains(&output.name) {
                return Err(PipelineError::invalid_stage(
                    id.as_str(),
                    format!("artifact '{}' is both consumed and produced", output.name),
                ));
            }
        }

        Ok(Self {
            description: id.to_string(),
            id,
            section: None,
            tool,
            args: Vec::new(),
            inputs,
            outputs,
            params: ParameterSet::default(),
            working_dir: None,
            timeout: None,
            sample: None,
        })
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, working_dir: Option<String>) -> Self {
        self.working_dir = working_dir;
        self
    }

    pub fn for_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.name.as_str())
    }
}

/// The full, validated set of stages of one pipeline, in declaration order.
#[derive(Debug, Clone)]
pub struct StageSet {
    stages: Vec<StageDefinition>,
    producers: HashMap<String, Producer>,
}

impl StageSet {
    pub fn new(stages: Vec<StageDefinition>, sources: &[String]) -> Result<Self, PipelineError> {
        let mut producers: HashMap<String, Producer> = HashMap::new();
        let mut ids = HashSet::new();

        for source in sources {
            producers.insert(source.clone(), Producer::External);
        }

        for stage in &stages {
            if !ids.insert(stage.id.clone()) {
                return Err(PipelineError::invalid_stage(
                    stage.id.as_str(),
                    "stage id is declared twice",
                ));
            }

            for output in &stage.outputs {
                if let Some(existing) = producers.get(&output.name) {
                    return Err(PipelineError::invalid_stage(
                        stage.id.as_str(),
                        format!(
                            "artifact '{}' collides with the one produced by '{}'",
                            output.name, existing
                        ),
                    ));
                }
                producers.insert(output.name.clone(), Producer::Stage(stage.id.clone()));
            }
        }

        for stage in &stages {
            for input in &stage.inputs {
                if !producers.contains_key(input) {
                    return Err(PipelineError::invalid_stage(
                        stage.id.as_str(),
                        format!("input '{}' has no producer", input),
                    ));
                }
            }
        }

        Ok(Self { stages, producers })
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn producer(&self, artifact: &str) -> Option<&Producer> {
        self.producers.get(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, inputs: &[&str], outputs: &[&str]) -> StageDefinition {
        StageDefinition::new(
            id,
            "true",
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs
                .iter()
                .map(|s| OutputSpec::new(*s, ArtifactKind::Report))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_stage_set_accepts_sources() {
        let set = StageSet::new(
            vec![
                stage("trim", &["raw"], &["trimmed"]),
                stage("import", &["trimmed"], &["demux"]),
            ],
            &["raw".to_string()],
        )
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.producer("raw"), Some(&Producer::External));
        assert_eq!(
            set.producer("demux"),
            Some(&Producer::Stage(StageId::new("import")))
        );
        assert_eq!(set.stages()[1].id.as_str(), "import");
    }

    #[test]
    fn test_missing_producer_is_invalid() {
        let err = StageSet::new(vec![stage("import", &["trimmed"], &["demux"])], &[]).unwrap_err();
        match err {
            PipelineError::InvalidStage { stage, reason } => {
                assert_eq!(stage, "import");
                assert!(reason.contains("'trimmed' has no producer"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_producer_is_invalid() {
        let err = StageSet::new(
            vec![stage("a", &[], &["table"]), stage("b", &[], &["table"])],
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_output_colliding_with_source_is_invalid() {
        let err =
            StageSet::new(vec![stage("a", &[], &["raw"])], &["raw".to_string()]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }

    #[test]
    fn test_duplicate_stage_id_is_invalid() {
        let err = StageSet::new(vec![stage("a", &[], &["x"]), stage("a", &[], &["y"])], &[])
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_definition_validation() {
        assert!(StageDefinition::new("", "qiime", vec![], vec![]).is_err());
        assert!(StageDefinition::new("a", " ", vec![], vec![]).is_err());
        assert!(StageDefinition::new(
            "a",
            "qiime",
            vec!["x".to_string()],
            vec![OutputSpec::new("x", ArtifactKind::Tree)]
        )
        .is_err());
        assert!(StageDefinition::new(
            "a",
            "qiime",
            vec![],
            vec![
                OutputSpec::new("x", ArtifactKind::Tree),
                OutputSpec::new("x", ArtifactKind::Tree)
            ]
        )
        .is_err());
    }
}
