//! Runtime Configuration
//!
//! Key-value settings resolved at graph-build time: chunk counts, thread
//! defaults for external tools, optional database paths that drive
//! activation predicates.
//!
//! Configuration is a YAML document of nested maps. Keys are addressed with
//! dotted paths, so `blastx.chunks` reads `chunks` inside the `blastx` map.
//!
//! ```yaml
//! workdir: daijin_run
//! blastx:
//!   prot_db: uniprot_sprot.fasta
//!   chunks: 10
//!   threads: 4
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_yaml::{Mapping, Value};

use crate::error::{EngineError, Result};

/// Configuration key holding the run working directory.
pub const WORKDIR_KEY: &str = "workdir";

/// Runtime configuration backed by a YAML value tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    root: Value,
}

impl RunConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }

    /// Parses configuration from YAML text. An empty document is an empty configuration.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text)
            .map_err(|e| EngineError::Configuration(format!("invalid configuration YAML: {}", e)))?;

        match root {
            Value::Null => Ok(Self::new()),
            Value::Mapping(_) => Ok(Self { root }),
            _ => Err(EngineError::Configuration(
                "configuration document must be a mapping".to_string(),
            )),
        }
    }

    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!(
                "failed to read configuration file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml_str(&text)
    }

    /// Looks up a value by dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.root, |node, part| match node {
            Value::Mapping(map) => map.get(&Value::String(part.to_string())),
            _ => None,
        })
    }

    /// Returns true if the key is present (even when its value is null).
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a value by dotted key, creating intermediate maps as needed.
    pub fn set(&mut self, key: &str, value: Value) {
        let parts: Vec<&str> = key.split('.').collect();
        let mut node = &mut self.root;

        for (i, part) in parts.iter().enumerate() {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = node else {
                return;
            };

            let map_key = Value::String(part.to_string());
            if i == parts.len() - 1 {
                map.insert(map_key, value);
                return;
            }
            if !map.contains_key(&map_key) {
                map.insert(map_key.clone(), Value::Mapping(Mapping::new()));
            }
            match map.get_mut(&map_key) {
                Some(next) => node = next,
                None => return,
            }
        }
    }

    /// Applies a `key=value` override. The value is parsed as a YAML scalar.
    pub fn apply_override(&mut self, assignment: &str) -> Result<()> {
        let (key, raw) = assignment.split_once('=').ok_or_else(|| {
            EngineError::Configuration(format!(
                "override '{}' must have the form KEY=VALUE",
                assignment
            ))
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(EngineError::Configuration(format!(
                "override '{}' has an empty key",
                assignment
            )));
        }

        let value = serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        debug!("Config override: {} = {:?}", key, value);
        self.set(key, value);
        Ok(())
    }

    /// Reads a scalar value as a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_to_string)
    }

    /// Reads a non-negative integer. Absent keys yield `Ok(None)`.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };

        let parsed = match value {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse::<usize>().ok(),
            _ => None,
        };

        parsed.map(Some).ok_or_else(|| {
            EngineError::Configuration(format!(
                "key '{}' must be a non-negative integer, found {:?}",
                key, value
            ))
        })
    }

    /// Reads a list of scalars.
    pub fn get_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };

        match value {
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item).ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "key '{}' must be a list of scalars",
                            key
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Value::Null => Ok(Some(Vec::new())),
            other => scalar_to_string(other)
                .map(|s| Some(vec![s]))
                .ok_or_else(|| EngineError::Configuration(format!("key '{}' must be a list", key))),
        }
    }

    /// True if the key is present and holds something other than null,
    /// an empty string, an empty collection or `false`.
    pub fn is_non_empty(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Sequence(seq)) => !seq.is_empty(),
            Some(Value::Mapping(map)) => !map.is_empty(),
            Some(Value::Bool(b)) => *b,
            Some(_) => true,
        }
    }

    /// True if the key holds boolean `true` (or the strings "true"/"yes").
    pub fn is_enabled(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes"),
            _ => false,
        }
    }

    /// The configured working directory, if any.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.get_str(WORKDIR_KEY)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
