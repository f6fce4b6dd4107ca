use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::errors::PipelineError;

const HEADER: [&str; 3] = [
    "sample-id",
    "forward-absolute-filepath",
    "reverse-absolute-filepath",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub forward: PathBuf,
    pub reverse: PathBuf,
}

impl Sample {
    pub fn forward_name(&self) -> String {
        file_name(&self.forward)
    }

    pub fn reverse_name(&self) -> String {
        file_name(&self.reverse)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Paired-end sample manifest in the QIIME2 `PairedEndFastqManifestPhred33V2` layout.
#[derive(Debug, Clone, Default)]
pub struct SampleManifest {
    path: PathBuf,
    samples: Vec<Sample>,
}

impl SampleManifest {
    pub fn new(path: PathBuf, samples: Vec<Sample>) -> Self {
        Self { path, samples }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => PipelineError::MissingInput {
                name: "sample manifest".to_string(),
                path: path.to_path_buf(),
            },
            _ => PipelineError::config(path, format!("cannot read sample manifest: {}", err)),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, path, base_dir)
    }

    pub fn parse(content: &str, origin: &Path, base_dir: &Path) -> Result<Self, PipelineError> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'));

        let (_, header) = lines
            .next()
            .ok_or_else(|| PipelineError::config(origin, "sample manifest is empty"))?;
        let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
        if columns != HEADER {
            return Err(PipelineError::config(
                origin,
                format!("expected header '{}'", HEADER.join("\\t")),
            ));
        }

        let mut samples = Vec::new();
        let mut seen = HashSet::new();

        for (index, line) in lines {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            if fields.len() != HEADER.len() || fields.iter().any(|f| f.is_empty()) {
                return Err(PipelineError::config(
                    origin,
                    format!("line {}: expected {} tab-separated fields", index + 1, HEADER.len()),
                ));
            }

            let id = fields[0].to_string();
            if !seen.insert(id.clone()) {
                return Err(PipelineError::config(
                    origin,
                    format!("line {}: duplicate sample id '{}'", index + 1, id),
                ));
            }

            samples.push(Sample {
                id,
                forward: resolve_path(fields[1], base_dir, origin)?,
                reverse: resolve_path(fields[2], base_dir, origin)?,
            });
        }

        if samples.is_empty() {
            return Err(PipelineError::config(origin, "sample manifest lists no samples"));
        }

        Ok(Self {
            path: origin.to_path_buf(),
            samples,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample(&self, id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn template() -> String {
        format!("{}\n", HEADER.join("\t"))
    }
}

fn resolve_path(raw: &str, base_dir: &Path, origin: &Path) -> Result<PathBuf, PipelineError> {
    let expanded = shellexpand::full(raw)
        .map_err(|err| PipelineError::config(origin, format!("cannot expand '{}': {}", raw, err)))?;
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(base_dir.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "sample-id\tforward-absolute-filepath\treverse-absolute-filepath\n\
        # run 1\n\
        20\t/data/20_S1_L001_R1_001.fastq.gz\t/data/20_S1_L001_R2_001.fastq.gz\n\
        60\treads/60_S2_L001_R1_001.fastq.gz\treads/60_S2_L001_R2_001.fastq.gz\n";

    #[test]
    fn test_parse_manifest() {
        let manifest =
            SampleManifest::parse(MANIFEST, Path::new("manifest.tsv"), Path::new("/project/raw_data"))
                .unwrap();

        assert_eq!(manifest.len(), 2);
        let first = &manifest.samples()[0];
        assert_eq!(first.id, "20");
        assert_eq!(first.forward_name(), "20_S1_L001_R1_001.fastq.gz");

        let second = manifest.sample("60").unwrap();
        assert_eq!(
            second.reverse,
            PathBuf::from("/project/raw_data/reads/60_S2_L001_R2_001.fastq.gz")
        );
    }

    #[test]
    fn test_missing_manifest_file_is_a_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.tsv");

        let err = SampleManifest::load_from_file(&path).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_duplicate_sample_is_rejected() {
        let content = format!("{}20\t/a_R1.fq\t/a_R2.fq\n", MANIFEST);
        let err = SampleManifest::parse(&content, Path::new("m.tsv"), Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate sample id '20'"));
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let err = SampleManifest::parse("id\tfwd\trev\n1\ta\tb\n", Path::new("m.tsv"), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let content = format!("{}\n100\t/only_R1.fq\n", SampleManifest::template());
        let err = SampleManifest::parse(&content, Path::new("m.tsv"), Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("tab-separated fields"));
    }

    #[test]
    fn test_empty_manifest_is_rejected() {
        let err =
            SampleManifest::parse(&SampleManifest::template(), Path::new("m.tsv"), Path::new("/"))
                .unwrap_err();
        assert!(err.to_string().contains("no samples"));
    }
}
