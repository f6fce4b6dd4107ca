use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Integer(v) => Some(ParamValue::Integer(*v)),
            toml::Value::Float(v) => Some(ParamValue::Float(*v)),
            toml::Value::Boolean(v) => Some(ParamValue::Bool(*v)),
            toml::Value::String(v) => Some(ParamValue::Text(v.clone())),
            _ => None,
        }
    }

    /// Parses a command-line `--set` value; anything that is not a TOML scalar is text.
    pub fn parse(raw: &str) -> Self {
        let wrapped = format!("v = {}", raw);
        toml::from_str::<toml::Table>(&wrapped)
            .ok()
            .and_then(|table| table.get("v").and_then(ParamValue::from_toml))
            .unwrap_or_else(|| ParamValue::Text(raw.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Integer(_) => "an integer",
            ParamValue::Float(_) => "a number",
            ParamValue::Bool(_) => "a boolean",
            ParamValue::Text(_) => "text",
        }
    }

    /// Converts an override to the declared value's type. Integers widen to
    /// floats and text accepts any scalar; other mismatches yield `None`.
    fn conform_to(self, declared: &ParamValue) -> Option<ParamValue> {
        match (declared, self) {
            (ParamValue::Integer(_), v @ ParamValue::Integer(_))
            | (ParamValue::Float(_), v @ ParamValue::Float(_))
            | (ParamValue::Bool(_), v @ ParamValue::Bool(_))
            | (ParamValue::Text(_), v @ ParamValue::Text(_)) => Some(v),
            (ParamValue::Float(_), ParamValue::Integer(v)) => Some(ParamValue::Float(v as f64)),
            (ParamValue::Text(_), v) => Some(ParamValue::Text(v.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{:.1}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Named scalar values substituted into command templates. Never mutated after
/// construction; overriding produces a new set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    pub fn new(values: BTreeMap<String, ParamValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Applies overrides; every overridden key must already be declared and
    /// keep the declared type.
    pub fn with_overrides(
        &self,
        overrides: &ParameterOverrides,
    ) -> Result<ParameterSet, PipelineError> {
        let mut values = self.values.clone();
        for (key, value) in &overrides.values {
            let Some(declared) = values.get(key) else {
                return Err(PipelineError::config(
                    &overrides.origin,
                    format!("unknown parameter '{}'", key),
                ));
            };
            let conformed = value.clone().conform_to(declared).ok_or_else(|| {
                PipelineError::config(
                    &overrides.origin,
                    format!(
                        "parameter '{}' expects {}, got {} '{}'",
                        key,
                        declared.type_name(),
                        value.type_name(),
                        value
                    ),
                )
            })?;
            values.insert(key.clone(), conformed);
        }
        Ok(ParameterSet { values })
    }

    /// Layers stage-local values over this set. Local keys may be new.
    pub fn layered(&self, local: &ParameterSet) -> ParameterSet {
        let mut values = self.values.clone();
        values.extend(local.values.clone());
        ParameterSet { values }
    }

    /// SHA-256 over the named parameters, skipping excluded keys.
    pub fn fingerprint<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String>,
        exclude: &[String],
    ) -> String {
        let keys: BTreeSet<&String> = keys
            .into_iter()
            .filter(|key| !exclude.contains(*key))
            .collect();

        let mut hasher = Sha256::new();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            if let Some(value) = self.values.get(key.as_str()) {
                hasher.update(value.to_string().as_bytes());
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Flat key/value overrides read from a parameter file or `--set` flags.
#[derive(Debug, Clone, Default)]
pub struct ParameterOverrides {
    values: BTreeMap<String, ParamValue>,
    origin: String,
}

impl ParameterOverrides {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::config(path, format!("cannot read parameter file: {}", err))
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, origin: &Path) -> Result<Self, PipelineError> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|err| PipelineError::config(origin, err.to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in table {
            let value = ParamValue::from_toml(&value).ok_or_else(|| {
                PipelineError::config(
                    origin,
                    format!("parameter '{}' must be a scalar value", key),
                )
            })?;
            values.insert(key, value);
        }

        Ok(Self {
            values,
            origin: origin.display().to_string(),
        })
    }

    /// Parses `key=value` pairs; later pairs win over file values.
    pub fn with_assignments(mut self, assignments: &[String]) -> Result<Self, PipelineError> {
        for assignment in assignments {
            let (key, value) = assignment.split_once('=').ok_or_else(|| {
                PipelineError::config(
                    "--set",
                    format!("expected key=value, got '{}'", assignment),
                )
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(PipelineError::config("--set", "empty parameter name"));
            }
            self.values
                .insert(key.to_string(), ParamValue::parse(value.trim()));
        }
        if self.origin.is_empty() {
            self.origin = "--set".to_string();
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
