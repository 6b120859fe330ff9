//! Wildcard Expansion
//!
//! Turns step definitions into concrete step instances once configuration
//! is known:
//! - Drops steps whose activation predicate is false
//! - Resolves each wildcard domain (literal list, zero-padded range, or a
//!   configuration list)
//! - Generates one instance per domain value for fan-out steps, substituting
//!   `{name}` in every path and in the command template
//! - Expands gather bindings into one path per domain value (fan-in)
//!
//! Only one wildcard may be bound per step; gather bindings may range over a
//! different wildcard than the one the step fans out over.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use log::{debug, info};

use crate::config::RunConfig;
use crate::error::{EngineError, Result};

use super::model::{Catalog, PathBinding, StepDefinition, WildcardDomain, WildcardSpec};

/// Identity of a step instance: step name plus its wildcard binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub step: String,
    pub binding: Option<(String, String)>,
}

impl InstanceId {
    /// Identity of an instance without wildcard binding.
    pub fn plain(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            binding: None,
        }
    }

    /// Identity of a fan-out instance.
    pub fn bound(step: impl Into<String>, wildcard: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            binding: Some((wildcard.into(), value.into())),
        }
    }

    /// File-name friendly form, e.g. `blastx_003`.
    pub fn file_stem(&self) -> String {
        match &self.binding {
            Some((_, value)) => format!("{}_{}", self.step, value),
            None => self.step.clone(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            Some((name, value)) => write!(f, "{}[{}={}]", self.step, name, value),
            None => write!(f, "{}", self.step),
        }
    }
}

/// A role with its concrete (still workdir-relative) paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRole {
    pub name: String,
    pub paths: Vec<String>,
}

/// A step definition with every wildcard bound. Immutable once created.
#[derive(Debug, Clone)]
pub struct StepInstance {
    pub id: InstanceId,
    pub inputs: Vec<ResolvedRole>,
    pub outputs: Vec<ResolvedRole>,
    pub params: BTreeMap<String, String>,
    pub wildcards: BTreeMap<String, String>,
    pub threads: usize,
    pub command: String,
    pub log: String,
    pub workdir: Option<String>,
    pub best_effort: bool,
    pub message: Option<String>,
}

/// Extracts wildcard names from a pattern.
///
/// Only identifier-shaped brace groups count, so shell constructs such as
/// `${HOME}` still match but `{print $1}` does not.
///
/// # Example
/// ```
/// use daijin::workflow::wildcards::extract_wildcard_names;
///
/// let names = extract_wildcard_names("blastx/{sample}_{chunk}.tsv");
/// assert_eq!(names, vec!["sample", "chunk"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let candidate = &after[..close];
        if is_identifier(candidate) {
            names.push(candidate.to_string());
        }
        rest = &after[close + 1..];
    }

    names
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitutes a wildcard in a string with a concrete value.
fn substitute_wildcard(text: &str, wildcard_name: &str, value: &str) -> String {
    text.replace(&format!("{{{}}}", wildcard_name), value)
}

/// Resolves a wildcard domain to its concrete values.
///
/// # Example
/// ```
/// use daijin::config::RunConfig;
/// use daijin::workflow::model::{Quantity, WildcardDomain, WildcardSpec};
/// use daijin::workflow::wildcards::resolve_domain;
///
/// let spec = WildcardSpec {
///     name: "chunk".to_string(),
///     domain: WildcardDomain::Range { count: Quantity::Literal(3), width: 3 },
/// };
/// let values = resolve_domain(&spec, &RunConfig::new()).unwrap();
/// assert_eq!(values, vec!["001", "002", "003"]);
/// ```
pub fn resolve_domain(spec: &WildcardSpec, config: &RunConfig) -> Result<Vec<String>> {
    let values = match &spec.domain {
        WildcardDomain::Values(values) => values.clone(),
        WildcardDomain::Range { count, width } => {
            let n = count.resolve(config).map_err(|e| {
                EngineError::Configuration(format!("wildcard '{}': {}", spec.name, e))
            })?;
            if n == 0 {
                return Err(EngineError::Configuration(format!(
                    "wildcard '{}' has non-positive domain size {}",
                    spec.name, n
                )));
            }
            (1..=n)
                .map(|i| format!("{:0width$}", i, width = *width))
                .collect()
        }
        WildcardDomain::FromConfig(key) => config.get_list(key)?.ok_or_else(|| {
            EngineError::Configuration(format!(
                "wildcard '{}' reads its values from '{}', which is not set",
                spec.name, key
            ))
        })?,
    };

    if values.is_empty() {
        return Err(EngineError::Configuration(format!(
            "wildcard '{}' has an empty domain",
            spec.name
        )));
    }

    let mut seen = HashSet::new();
    if let Some(dup) = values.iter().find(|v| !seen.insert(v.as_str())) {
        return Err(EngineError::Configuration(format!(
            "wildcard '{}' lists value '{}' more than once",
            spec.name, dup
        )));
    }

    Ok(values)
}

/// Expands the catalog into concrete step instances.
///
/// Inactive steps produce no instances. Fan-out steps produce one instance
/// per value of their wildcard's domain; everything else produces exactly one.
pub fn expand(catalog: &Catalog, config: &RunConfig) -> Result<Vec<StepInstance>> {
    info!("Expanding {} step definitions...", catalog.len());

    let mut expander = Expander {
        catalog,
        config,
        domains: HashMap::new(),
    };
    let mut instances = Vec::new();

    for def in &catalog.steps {
        if !def.is_active(config) {
            info!("Step '{}' is inactive under current configuration - dropped", def.name);
            continue;
        }

        let expanded = expander.expand_step(def)?;
        if def.fan_out.is_some() {
            info!("Expanding step '{}' into {} instances", def.name, expanded.len());
        }
        instances.extend(expanded);
    }

    info!("Wildcard expansion complete: {} step instances", instances.len());
    Ok(instances)
}

struct Expander<'a> {
    catalog: &'a Catalog,
    config: &'a RunConfig,
    domains: HashMap<String, Vec<String>>,
}

impl<'a> Expander<'a> {
    fn domain(&mut self, step: &str, wildcard: &str) -> Result<Vec<String>> {
        if let Some(values) = self.domains.get(wildcard) {
            return Ok(values.clone());
        }

        let spec = self.catalog.wildcard_spec(wildcard).ok_or_else(|| {
            EngineError::Configuration(format!(
                "step '{}' uses undeclared wildcard '{}'",
                step, wildcard
            ))
        })?;
        let values = resolve_domain(&spec, self.config)?;
        debug!("Wildcard '{}' -> {:?}", wildcard, values);

        self.domains.insert(wildcard.to_string(), values.clone());
        Ok(values)
    }

    fn expand_step(&mut self, def: &StepDefinition) -> Result<Vec<StepInstance>> {
        let threads = def.threads.resolve(self.config).map_err(|e| {
            EngineError::Configuration(format!("step '{}' threads: {}", def.name, e))
        })?;
        if threads == 0 {
            return Err(EngineError::Configuration(format!(
                "step '{}' requires a positive thread count",
                def.name
            )));
        }

        let params = def
            .params
            .iter()
            .map(|(name, value)| Ok((name.clone(), value.resolve(name, self.config)?)))
            .collect::<Result<BTreeMap<String, String>>>()?;

        let bindings: Vec<Option<(String, String)>> = match &def.fan_out {
            None => vec![None],
            Some(wildcard) => self
                .domain(&def.name, wildcard)?
                .into_iter()
                .map(|value| Some((wildcard.clone(), value)))
                .collect(),
        };

        bindings
            .into_iter()
            .map(|binding| self.instantiate(def, binding, threads, &params))
            .collect()
    }

    fn instantiate(
        &mut self,
        def: &StepDefinition,
        binding: Option<(String, String)>,
        threads: usize,
        params: &BTreeMap<String, String>,
    ) -> Result<StepInstance> {
        let id = InstanceId {
            step: def.name.clone(),
            binding: binding.clone(),
        };

        let bind = |text: &str| match &binding {
            Some((name, value)) => substitute_wildcard(text, name, value),
            None => text.to_string(),
        };

        let mut inputs = Vec::with_capacity(def.inputs.len());
        for role in &def.inputs {
            let paths = match &role.binding {
                PathBinding::Single(pattern) => vec![bind(pattern)],
                PathBinding::Gather { gather, over } => self
                    .domain(&def.name, over)?
                    .iter()
                    .map(|value| bind(&substitute_wildcard(gather, over, value)))
                    .collect(),
            };
            for path in &paths {
                ensure_fully_bound(&id, &role.name, path)?;
            }
            inputs.push(ResolvedRole {
                name: role.name.clone(),
                paths,
            });
        }

        let mut outputs = Vec::with_capacity(def.outputs.len());
        for role in &def.outputs {
            let path = bind(role.binding.pattern());
            ensure_fully_bound(&id, &role.name, &path)?;
            outputs.push(ResolvedRole {
                name: role.name.clone(),
                paths: vec![path],
            });
        }

        let log = match &def.log {
            Some(pattern) => bind(pattern),
            None => format!("logs/{}.log", id.file_stem()),
        };
        ensure_fully_bound(&id, "log", &log)?;

        let workdir = def.workdir.as_deref().map(bind);
        if let Some(dir) = &workdir {
            ensure_fully_bound(&id, "workdir", dir)?;
        }

        let wildcards = binding.iter().cloned().collect();
        let instance = StepInstance {
            inputs,
            outputs,
            params: params.clone(),
            wildcards,
            threads,
            command: bind(&def.command),
            log,
            workdir,
            best_effort: def.best_effort,
            message: def.message.clone(),
            id,
        };

        debug!(
            "  Created instance '{}' with inputs={:?}, outputs={:?}",
            instance.id, instance.inputs, instance.outputs
        );
        Ok(instance)
    }
}

fn ensure_fully_bound(id: &InstanceId, role: &str, path: &str) -> Result<()> {
    match extract_wildcard_names(path).first() {
        Some(name) => Err(EngineError::Configuration(format!(
            "step '{}' role '{}': path '{}' uses wildcard '{{{}}}' which the step does not bind",
            id, role, path, name
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Activation, Quantity};

    fn chunked_catalog(count: Quantity) -> Catalog {
        Catalog::new()
            .with_wildcard("chunk", WildcardDomain::Range { count, width: 3 })
            .with_step(
                StepDefinition::new("split", "split {input.fasta}")
                    .with_input("fasta", "transcripts.fa")
                    .with_output("done", "split/done"),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("align", "align split/{chunk}.fa > {output.hits}")
                    .with_input("marker", "split/done")
                    .with_output("hits", "align/{chunk}.tsv")
                    .with_fan_out("chunk"),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("align_all", "cat {input.chunks} > {output.merged}")
                    .with_gather_input("chunks", "align/{chunk}.tsv", "chunk")
                    .with_output("merged", "align/all.tsv"),
            )
            .unwrap()
    }

    #[test]
    fn test_extract_wildcard_names() {
        assert_eq!(extract_wildcard_names("reads/{sample}.fastq"), vec!["sample"]);
        assert_eq!(
            extract_wildcard_names("{id}_{replicate}.txt"),
            vec!["id", "replicate"]
        );
        assert!(extract_wildcard_names("awk '{print $1}' x").is_empty());
        assert!(extract_wildcard_names("{input.reads}").is_empty());
        assert!(extract_wildcard_names("regular_file.txt").is_empty());
    }

    #[test]
    fn test_substitute_wildcard() {
        let result = substitute_wildcard("align/{chunk}.tsv", "chunk", "002");
        assert_eq!(result, "align/002.tsv");
    }

    #[test]
    fn test_range_domain_padding() {
        let spec = WildcardSpec {
            name: "chunk".into(),
            domain: WildcardDomain::Range { count: Quantity::Literal(10), width: 2 },
        };
        let values = resolve_domain(&spec, &RunConfig::new()).unwrap();
        assert_eq!(values.first().unwrap(), "01");
        assert_eq!(values.last().unwrap(), "10");

        let spec = WildcardSpec {
            name: "chunk".into(),
            domain: WildcardDomain::Range { count: Quantity::Literal(3), width: 0 },
        };
        assert_eq!(resolve_domain(&spec, &RunConfig::new()).unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_domain_errors() {
        let zero = WildcardSpec {
            name: "chunk".into(),
            domain: WildcardDomain::Range { count: Quantity::Literal(0), width: 1 },
        };
        assert!(matches!(
            resolve_domain(&zero, &RunConfig::new()),
            Err(EngineError::Configuration(_))
        ));

        let missing = WildcardSpec {
            name: "chunk".into(),
            domain: WildcardDomain::Range {
                count: Quantity::Config { config: "chunks".into(), default: None },
                width: 1,
            },
        };
        assert!(resolve_domain(&missing, &RunConfig::new()).is_err());

        let dup = WildcardSpec {
            name: "sample".into(),
            domain: WildcardDomain::Values(vec!["a".into(), "a".into()]),
        };
        assert!(resolve_domain(&dup, &RunConfig::new()).is_err());

        let from_config = WildcardSpec {
            name: "sample".into(),
            domain: WildcardDomain::FromConfig("samples".into()),
        };
        assert!(resolve_domain(&from_config, &RunConfig::new()).is_err());
        let config = RunConfig::from_yaml_str("samples: [liver, brain]").unwrap();
        assert_eq!(resolve_domain(&from_config, &config).unwrap(), vec!["liver", "brain"]);
    }

    #[test]
    fn test_fan_out_and_gather() {
        let catalog = chunked_catalog(Quantity::Config { config: "chunks".into(), default: None });
        let config = RunConfig::from_yaml_str("chunks: 3").unwrap();

        let instances = expand(&catalog, &config).unwrap();
        assert_eq!(instances.len(), 5);

        let ids: Vec<String> = instances.iter().map(|i| i.id.to_string()).collect();
        assert!(ids.contains(&"align[chunk=002]".to_string()));

        let align2 = instances
            .iter()
            .find(|i| i.id == InstanceId::bound("align", "chunk", "002"))
            .unwrap();
        assert_eq!(align2.outputs[0].paths, vec!["align/002.tsv"]);
        assert_eq!(align2.command, "align split/002.fa > {output.hits}");
        assert_eq!(align2.log, "logs/align_002.log");
        assert_eq!(align2.wildcards.get("chunk").map(String::as_str), Some("002"));

        let join = instances.iter().find(|i| i.id.step == "align_all").unwrap();
        assert_eq!(
            join.inputs[0].paths,
            vec!["align/001.tsv", "align/002.tsv", "align/003.tsv"]
        );
    }

    #[test]
    fn test_single_chunk() {
        let catalog = chunked_catalog(Quantity::Literal(1));
        let instances = expand(&catalog, &RunConfig::new()).unwrap();

        assert_eq!(instances.iter().filter(|i| i.id.step == "align").count(), 1);
        let join = instances.iter().find(|i| i.id.step == "align_all").unwrap();
        assert_eq!(join.inputs[0].paths, vec!["align/001.tsv"]);
    }

    #[test]
    fn test_missing_chunk_config() {
        let catalog = chunked_catalog(Quantity::Config { config: "chunks".into(), default: None });
        let result = expand(&catalog, &RunConfig::new());
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_inactive_step_dropped() {
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("blastx", "blastx > {output.hits}")
                    .with_output("hits", "hits.tsv")
                    .with_activation(Activation::NonEmpty("prot_db".into())),
            )
            .unwrap();

        let off = RunConfig::from_yaml_str("prot_db: ''").unwrap();
        assert!(expand(&catalog, &off).unwrap().is_empty());

        let on = RunConfig::from_yaml_str("prot_db: sprot.fa").unwrap();
        assert_eq!(expand(&catalog, &on).unwrap().len(), 1);
    }

    #[test]
    fn test_unbound_wildcard_rejected() {
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("bad", "echo")
                    .with_output("out", "out/{sample}.txt"),
            )
            .unwrap();

        let err = expand(&catalog, &RunConfig::new()).unwrap_err();
        assert!(err.to_string().contains("sample"));
    }

    #[test]
    fn test_undeclared_fan_out_wildcard() {
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("bad", "echo").with_fan_out("nowhere"))
            .unwrap();
        assert!(matches!(
            expand(&catalog, &RunConfig::new()),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_threads_from_config() {
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("tool", "tool -t {threads}")
                    .with_config_threads("tool.threads", Some(2)),
            )
            .unwrap();

        let instances = expand(&catalog, &RunConfig::new()).unwrap();
        assert_eq!(instances[0].threads, 2);

        let config = RunConfig::from_yaml_str("tool:\n  threads: 12").unwrap();
        assert_eq!(expand(&catalog, &config).unwrap()[0].threads, 12);

        let config = RunConfig::from_yaml_str("tool:\n  threads: 0").unwrap();
        assert!(expand(&catalog, &config).is_err());
    }

    #[test]
    fn test_instance_id_display() {
        assert_eq!(InstanceId::plain("prepare").to_string(), "prepare");
        let id = InstanceId::bound("align", "chunk", "007");
        assert_eq!(id.to_string(), "align[chunk=007]");
        assert_eq!(id.file_stem(), "align_007");
    }
}
