use std::path::{Path, PathBuf};

use crate::errors::PipelineError;

/// Section name to directory, relative to the project root. The numeric
/// prefixes mirror the position of each step in the pipeline.
const SECTIONS: [(&str, &str); 13] = [
    ("raw", "raw_data"),
    ("fastqc_raw", "clean_data/1-fastqc_raw"),
    ("trimmed", "clean_data/2-trimmed"),
    ("removed", "clean_data/2-removed"),
    ("fastqc_trimmed", "clean_data/3-fastqc_trimmed"),
    ("fastqc_removed", "clean_data/3-fastqc_removed"),
    ("import", "pipeline_output/1-import"),
    ("denoise", "pipeline_output/2-denoise"),
    ("phylogeny", "pipeline_output/3-phylogeny"),
    ("diversity", "pipeline_output/4-diversity"),
    ("taxonomy", "pipeline_output/5-taxonomy"),
    ("logs", "pipeline_output/logs"),
    ("output", "pipeline_output"),
];

#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    reference_db: String,
}

impl ProjectLayout {
    pub fn new(root: PathBuf, reference_db: impl Into<String>) -> Self {
        Self {
            root,
            reference_db: reference_db.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reference_db(&self) -> &str {
        &self.reference_db
    }

    pub fn section_names() -> impl Iterator<Item = &'static str> {
        SECTIONS
            .iter()
            .map(|(name, _)| *name)
            .chain(std::iter::once("database"))
    }

    pub fn section_dir(&self, section: &str) -> Option<PathBuf> {
        if section == "database" {
            return Some(self.database_dir());
        }

        SECTIONS
            .iter()
            .find(|(name, _)| *name == section)
            .map(|(_, relative)| self.root.join(relative))
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join("databases").join(&self.reference_db)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("pipeline_output")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("pipeline_output").join("logs")
    }

    /// Resolves a possibly relative path against the project root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Creates every directory of the layout. Existing directories are left alone.
    pub fn scaffold(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut created = Vec::new();
        let dirs = SECTIONS
            .iter()
            .map(|(_, relative)| self.root.join(relative))
            .chain(std::iter::once(self.database_dir()));

        for dir in dirs {
            if !dir.is_dir() {
                std::fs::create_dir_all(&dir).map_err(|err| {
                    PipelineError::io(format!("cannot create {}", dir.display()), err)
                })?;
                created.push(dir);
            }
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_dirs() {
        let layout = ProjectLayout::new(PathBuf::from("/project"), "silva-138");

        assert_eq!(
            layout.section_dir("trimmed"),
            Some(PathBuf::from("/project/clean_data/2-trimmed"))
        );
        assert_eq!(
            layout.section_dir("taxonomy"),
            Some(PathBuf::from("/project/pipeline_output/5-taxonomy"))
        );
        assert_eq!(
            layout.section_dir("database"),
            Some(PathBuf::from("/project/databases/silva-138"))
        );
        assert_eq!(layout.section_dir("nope"), None);
    }

    #[test]
    fn test_scaffold_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(temp.path().to_path_buf(), "silva-138");

        let created = layout.scaffold().unwrap();
        assert!(created.contains(&temp.path().join("clean_data/2-removed")));
        assert!(temp.path().join("clean_data/3-fastqc_removed").is_dir());
        assert!(temp.path().join("databases/silva-138").is_dir());

        let created_again = layout.scaffold().unwrap();
        assert!(created_again.is_empty());
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let layout = ProjectLayout::new(PathBuf::from("/project"), "db");
        assert_eq!(
            layout.resolve("raw_data/manifest.tsv"),
            PathBuf::from("/project/raw_data/manifest.tsv")
        );
        assert_eq!(layout.resolve("/refs/seqs.fasta"), PathBuf::from("/refs/seqs.fasta"));
    }
}
