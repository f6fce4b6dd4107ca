use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::artifact::ArtifactStore;
use crate::errors::{command_line, PipelineError};
use crate::layout::ProjectLayout;
use crate::manifest::SampleManifest;
use crate::params::ParameterSet;
use crate::stage::StageDefinition;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// Fully rendered external command of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub description: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn command_line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.description)?;
        write!(f, "  {}", self.command_line())
    }
}

/// Everything a placeholder can refer to while rendering one stage.
pub struct TemplateContext<'a> {
    pub stage: &'a StageDefinition,
    pub params: &'a ParameterSet,
    pub store: &'a ArtifactStore,
    pub layout: &'a ProjectLayout,
    pub manifest: &'a SampleManifest,
}

/// Result of rendering: the text plus every parameter it referenced.
#[derive(Debug, Default)]
pub struct Rendered {
    pub values: Vec<String>,
    pub params_used: BTreeSet<String>,
}

impl<'a> TemplateContext<'a> {
    /// Renders the stage's command. A placeholder forming a whole argument
    /// that names a wildcard artifact (`{in:raw-forward[*]}`) expands into
    /// one argument per sample.
    pub fn render_command(&self) -> Result<(ToolCommand, BTreeSet<String>), PipelineError> {
        let mut rendered = Rendered::default();

        for arg in &self.stage.args {
            if let Some(expanded) = self.expand_whole_wildcard(arg)? {
                rendered.values.extend(expanded);
                continue;
            }
            let value = self.render_into(arg, &mut rendered.params_used)?;
            rendered.values.push(value);
        }

        let command = ToolCommand {
            description: self.stage.description.clone(),
            program: self.render_into(&self.stage.tool, &mut rendered.params_used)?,
            args: rendered.values,
        };

        Ok((command, rendered.params_used))
    }

    /// Renders a single string, recording referenced parameters in `used`.
    pub fn render_into(
        &self,
        template: &str,
        used: &mut BTreeSet<String>,
    ) -> Result<String, PipelineError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            out.push_str(&self.resolve(&caps[1], used)?);
            last = whole.end();
        }
        out.push_str(&template[last..]);

        Ok(out)
    }

    pub fn render(&self, template: &str) -> Result<String, PipelineError> {
        let mut used = BTreeSet::new();
        self.render_into(template, &mut used)
    }

    fn expand_whole_wildcard(&self, arg: &str) -> Result<Option<Vec<String>>, PipelineError> {
        let Some(caps) = PLACEHOLDER.captures(arg) else {
            return Ok(None);
        };
        let inner = &caps[1];
        let Some((prefix, name)) = inner.split_once(':') else {
            return Ok(None);
        };
        if !matches!(prefix, "in" | "out") || !is_wildcard(name) {
            return Ok(None);
        }

        if caps.get(0).map(|m| m.as_str()) != Some(arg) {
            return Err(PipelineError::invalid_stage(
                self.stage.id.as_str(),
                format!("wildcard placeholder '{{{}}}' must be a whole argument", inner),
            ));
        }

        let names = expand_wildcard(name, self.manifest);
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            self.check_declared(prefix, &name)?;
            values.push(self.artifact_path(&name)?.display().to_string());
        }
        Ok(Some(values))
    }

    fn resolve(&self, key: &str, used: &mut BTreeSet<String>) -> Result<String, PipelineError> {
        if let Some(value) = resolve_layout_key(key, self.layout, self.manifest) {
            return Ok(value);
        }

        if let Some((prefix, rest)) = key.split_once(':') {
            return match prefix {
                "in" | "out" => {
                    if is_wildcard(rest) {
                        return Err(PipelineError::invalid_stage(
                            self.stage.id.as_str(),
                            format!("wildcard placeholder '{{{}}}' must be a whole argument", key),
                        ));
                    }
                    self.check_declared(prefix, rest)?;
                    Ok(self.artifact_path(rest)?.display().to_string())
                }
                _ => Err(self.unknown(key)),
            };
        }

        if key == "stage" {
            return Ok(self.stage.id.to_string());
        }

        match self.params.get(key) {
            Some(value) => {
                used.insert(key.to_string());
                Ok(value.to_string())
            }
            None => Err(self.unknown(key)),
        }
    }

    fn check_declared(&self, prefix: &str, name: &str) -> Result<(), PipelineError> {
        let declared = match prefix {
            "in" => self.stage.inputs.iter().any(|input| input == name),
            _ => self.stage.outputs.iter().any(|output| output.name == name),
        };

        if declared {
            Ok(())
        } else {
            let role = if prefix == "in" { "input" } else { "output" };
            Err(PipelineError::invalid_stage(
                self.stage.id.as_str(),
                format!("'{}' is used in the command but not declared as an {}", name, role),
            ))
        }
    }

    fn artifact_path(&self, name: &str) -> Result<PathBuf, PipelineError> {
        self.store.resolve(name).map(|path| path.to_path_buf())
    }

    fn unknown(&self, key: &str) -> PipelineError {
        PipelineError::invalid_stage(
            self.stage.id.as_str(),
            format!("unknown placeholder '{{{}}}'", key),
        )
    }
}

/// Placeholders that only depend on the project layout.
fn resolve_layout_key(key: &str, layout: &ProjectLayout, manifest: &SampleManifest) -> Option<String> {
    match key {
        "root" => Some(layout.root().display().to_string()),
        "manifest" => Some(manifest.path().display().to_string()),
        "reference_db" => Some(layout.reference_db().to_string()),
        _ => key
            .strip_prefix("dir:")
            .and_then(|section| layout.section_dir(section))
            .map(|dir| dir.display().to_string()),
    }
}

/// Renders a path template (source paths, output paths, working directories).
/// Only layout placeholders are allowed so paths never depend on parameters.
/// Returns the offending placeholder on failure.
pub fn render_path(
    template: &str,
    layout: &ProjectLayout,
    manifest: &SampleManifest,
) -> Result<PathBuf, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        let value = resolve_layout_key(&caps[1], layout, manifest)
            .ok_or_else(|| whole.as_str().to_string())?;
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(layout.resolve(&out))
}

pub fn is_wildcard(name: &str) -> bool {
    name.ends_with("[*]")
}

/// `trimmed-forward[*]` -> `trimmed-forward[20]`, `trimmed-forward[60]`, ...
pub fn expand_wildcard(name: &str, manifest: &SampleManifest) -> Vec<String> {
    match name.strip_suffix("[*]") {
        Some(base) => manifest
            .samples()
            .iter()
            .map(|sample| format!("{}[{}]", base, sample.id))
            .collect(),
        None => vec![name.to_string()],
    }
}
