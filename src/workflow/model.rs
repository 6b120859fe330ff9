//! Step Catalog Data Model
//!
//! Immutable declarations of pipeline steps and the wildcard domains they
//! fan out over.
//!
//! # Example YAML Format
//!
//! ```yaml
//! wildcards:
//!   chunk:
//!     range:
//!       count: { config: blastx.chunks }
//!       width: 3
//!
//! steps:
//!   - name: split
//!     inputs:
//!       fasta: transcripts.fasta
//!     outputs:
//!       done: split/split.done
//!     command: split_fasta {input.fasta} split/chunk {params.chunks} && touch {output.done}
//!     params:
//!       chunks: { config: blastx.chunks }
//!
//!   - name: blastx
//!     fan_out: chunk
//!     when: { non_empty: blastx.prot_db }
//!     best_effort: true
//!     inputs:
//!       marker: split/split.done
//!     outputs:
//!       hits: blastx/chunk_{chunk}.tsv
//!     threads: { config: blastx.threads, default: 1 }
//!     command: blastx -query split/chunk_{chunk}.fa -num_threads {threads} > {output.hits}
//!
//!   - name: blastx_all
//!     inputs:
//!       chunks: { gather: blastx/chunk_{chunk}.tsv, over: chunk }
//!     outputs:
//!       merged: blastx/all.tsv
//!     command: cat {input.chunks} > {output.merged}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::config::RunConfig;
use crate::error::{EngineError, Result};

/// A count that is either written literally or read from configuration.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Quantity {
    Literal(usize),
    Config {
        config: String,
        #[serde(default)]
        default: Option<usize>,
    },
}

impl Quantity {
    /// Resolves the quantity against configuration.
    pub fn resolve(&self, config: &RunConfig) -> Result<usize> {
        match self {
            Self::Literal(n) => Ok(*n),
            Self::Config { config: key, default } => match config.get_usize(key)? {
                Some(n) => Ok(n),
                None => default.ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "required configuration key '{}' is not set",
                        key
                    ))
                }),
            },
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(n) => write!(f, "{}", n),
            Self::Config { config, default: Some(d) } => write!(f, "config({}, default {})", config, d),
            Self::Config { config, default: None } => write!(f, "config({})", config),
        }
    }
}

/// Default thread requirement for steps that don't specify one.
fn default_threads() -> Quantity {
    Quantity::Literal(1)
}

/// How a file role is bound to paths.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PathBinding {
    /// One path expression, possibly containing the step's wildcard token.
    Single(String),
    /// One path per value of another wildcard's domain (fan-in).
    Gather { gather: String, over: String },
}

impl PathBinding {
    /// The path expression of this binding.
    pub fn pattern(&self) -> &str {
        match self {
            Self::Single(pattern) => pattern,
            Self::Gather { gather, .. } => gather,
        }
    }
}

/// A named input or output slot of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRole {
    pub name: String,
    pub binding: PathBinding,
}

/// A step parameter: a scalar, or a scalar read from configuration.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Config {
        config: String,
        #[serde(default)]
        default: Option<Value>,
    },
    Scalar(Value),
}

impl ParamValue {
    /// Resolves the parameter to its textual value.
    pub fn resolve(&self, name: &str, config: &RunConfig) -> Result<String> {
        let value = match self {
            Self::Scalar(value) => value.clone(),
            Self::Config { config: key, default } => match config.get(key) {
                Some(value) => value.clone(),
                None => default.clone().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "parameter '{}' needs configuration key '{}', which is not set",
                        name, key
                    ))
                })?,
            },
        };

        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Ok(String::new()),
            _ => Err(EngineError::Configuration(format!(
                "parameter '{}' must be a scalar",
                name
            ))),
        }
    }
}

/// Activation predicate deciding whether a step is part of the graph.
///
/// A closed set of checks against configuration values.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Key is set to a non-empty value.
    NonEmpty(String),
    /// Key is absent or empty.
    Empty(String),
    /// Key holds boolean true.
    Enabled(String),
    /// Key's scalar value equals the given text.
    Equals { key: String, value: String },
    Not(Box<Activation>),
    All(Vec<Activation>),
    Any(Vec<Activation>),
}

impl Activation {
    /// Evaluates the predicate against configuration.
    pub fn evaluate(&self, config: &RunConfig) -> bool {
        match self {
            Self::NonEmpty(key) => config.is_non_empty(key),
            Self::Empty(key) => !config.is_non_empty(key),
            Self::Enabled(key) => config.is_enabled(key),
            Self::Equals { key, value } => config.get_str(key).as_deref() == Some(value.as_str()),
            Self::Not(inner) => !inner.evaluate(config),
            Self::All(items) => items.iter().all(|p| p.evaluate(config)),
            Self::Any(items) => items.iter().any(|p| p.evaluate(config)),
        }
    }
}

/// The set of values a wildcard ranges over.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WildcardDomain {
    /// A literal list of values.
    Values(Vec<String>),
    /// `1..=count`, zero-padded to `width` digits.
    Range {
        count: Quantity,
        #[serde(default)]
        width: usize,
    },
    /// A list read from configuration.
    FromConfig(String),
}

/// A named wildcard together with its domain.
#[derive(Debug, Clone, PartialEq)]
pub struct WildcardSpec {
    pub name: String,
    pub domain: WildcardDomain,
}

/// Immutable description of one unit of work.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,

    /// Ordered input roles
    #[serde(default, deserialize_with = "ordered_roles")]
    pub inputs: Vec<FileRole>,

    /// Ordered output roles
    #[serde(default, deserialize_with = "ordered_roles")]
    pub outputs: Vec<FileRole>,

    /// Scalar parameters available as `{params.<name>}`
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    /// Thread requirement
    #[serde(default = "default_threads")]
    pub threads: Quantity,

    /// Shell command template
    pub command: String,

    /// Wildcard this step fans out over
    #[serde(default)]
    pub fan_out: Option<String>,

    /// Activation predicate; the step is dropped when it evaluates false
    #[serde(default, deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub when: Option<Activation>,

    /// Tolerate a non-zero exit as long as every output was written
    #[serde(default)]
    pub best_effort: bool,

    /// Log file path expression
    #[serde(default)]
    pub log: Option<String>,

    /// Working directory relative to the run directory
    #[serde(default)]
    pub workdir: Option<String>,

    /// Message logged when the step starts
    #[serde(default)]
    pub message: Option<String>,
}

/// Deserializes a role mapping while keeping declaration order.
fn ordered_roles<'de, D>(deserializer: D) -> std::result::Result<Vec<FileRole>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(mapping) = Option::<Mapping>::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };

    mapping
        .into_iter()
        .map(|(key, value)| {
            let name = match key {
                Value::String(s) => s,
                other => return Err(de::Error::custom(format!("role name must be a string, found {:?}", other))),
            };
            let binding = serde_yaml::from_value::<PathBinding>(value).map_err(|e| {
                de::Error::custom(format!(
                    "role '{}' must be a path or {{ gather, over }}: {}",
                    name, e
                ))
            })?;
            Ok(FileRole { name, binding })
        })
        .collect()
}

impl StepDefinition {
    /// Creates a new step definition.
    ///
    /// # Example
    ///
    /// ```
    /// use daijin::workflow::StepDefinition;
    ///
    /// let step = StepDefinition::new("align", "aligner -t {threads} {input.reads} > {output.bam}")
    ///     .with_input("reads", "reads/{chunk}.fq")
    ///     .with_output("bam", "aligned/{chunk}.bam")
    ///     .with_fan_out("chunk")
    ///     .with_threads(4);
    /// assert_eq!(step.outputs.len(), 1);
    /// ```
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            threads: default_threads(),
            command: command.into().trim().to_string(),
            fan_out: None,
            when: None,
            best_effort: false,
            log: None,
            workdir: None,
            message: None,
        }
    }

    /// Adds an input role bound to a single path expression.
    pub fn with_input(mut self, role: impl Into<String>, path: impl Into<String>) -> Self {
        self.inputs.push(FileRole {
            name: role.into(),
            binding: PathBinding::Single(path.into()),
        });
        self
    }

    /// Adds an input role gathering one path per value of `over`.
    pub fn with_gather_input(
        mut self,
        role: impl Into<String>,
        pattern: impl Into<String>,
        over: impl Into<String>,
    ) -> Self {
        self.inputs.push(FileRole {
            name: role.into(),
            binding: PathBinding::Gather {
                gather: pattern.into(),
                over: over.into(),
            },
        });
        self
    }

    /// Adds an output role.
    pub fn with_output(mut self, role: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.push(FileRole {
            name: role.into(),
            binding: PathBinding::Single(path.into()),
        });
        self
    }

    /// Sets a literal parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(name.into(), ParamValue::Scalar(Value::String(value.into())));
        self
    }

    /// Sets a fixed thread requirement.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Quantity::Literal(threads);
        self
    }

    /// Reads the thread requirement from configuration.
    pub fn with_config_threads(mut self, key: impl Into<String>, default: Option<usize>) -> Self {
        self.threads = Quantity::Config {
            config: key.into(),
            default,
        };
        self
    }

    /// Fans this step out over a catalog wildcard.
    pub fn with_fan_out(mut self, wildcard: impl Into<String>) -> Self {
        self.fan_out = Some(wildcard.into());
        self
    }

    /// Sets the activation predicate.
    pub fn with_activation(mut self, predicate: Activation) -> Self {
        self.when = Some(predicate);
        self
    }

    /// Marks the step as best-effort.
    pub fn as_best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Sets the log path expression.
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// Sets the per-step working directory.
    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Looks up an input role by name.
    pub fn input(&self, role: &str) -> Option<&FileRole> {
        self.inputs.iter().find(|r| r.name == role)
    }

    /// Looks up an output role by name.
    pub fn output(&self, role: &str) -> Option<&FileRole> {
        self.outputs.iter().find(|r| r.name == role)
    }

    /// Returns true if the activation predicate (if any) holds.
    pub fn is_active(&self, config: &RunConfig) -> bool {
        self.when.as_ref().map_or(true, |p| p.evaluate(config))
    }
}

/// The full set of step definitions plus shared wildcard domains.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    /// Wildcard domains by name
    #[serde(default, deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub wildcards: BTreeMap<String, WildcardDomain>,

    /// Step definitions in declaration order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a wildcard domain.
    pub fn with_wildcard(mut self, name: impl Into<String>, domain: WildcardDomain) -> Self {
        self.wildcards.insert(name.into(), domain);
        self
    }

    /// Adds a step; names must be unique.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<()> {
        if self.get_step(&step.name).is_some() {
            return Err(EngineError::Catalog(format!(
                "step '{}' already exists",
                step.name
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder-style variant of [`Catalog::add_step`] for assembling catalogs in code.
    pub fn with_step(mut self, step: StepDefinition) -> Result<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the named wildcard with its domain.
    pub fn wildcard_spec(&self, name: &str) -> Option<WildcardSpec> {
        self.wildcards.get(name).map(|domain| WildcardSpec {
            name: name.to_string(),
            domain: domain.clone(),
        })
    }

    /// Returns the number of step definitions.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the catalog has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
