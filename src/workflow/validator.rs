//! Catalog Validation
//!
//! Static checks on a step catalog, run once after parsing and before any
//! configuration is applied:
//! - Step names are present, unique and usable in file names
//! - Commands are non-empty
//! - Fan-out and gather wildcards are declared, and not reserved words
//! - Path expressions only use wildcards the step binds
//! - Wildcard domains are not trivially empty
//!
//! Everything that depends on configuration (domain sizes, thread counts,
//! activation) is checked during expansion instead.

use std::collections::HashSet;
use std::fmt;

use log::{debug, info, warn};

use crate::error::{EngineError, Result};

use super::model::{Catalog, PathBinding, Quantity, StepDefinition, WildcardDomain};
use super::wildcards::extract_wildcard_names;

/// Names reserved by the command template syntax.
pub const RESERVED_WILDCARDS: &[&str] = &["input", "output", "params", "threads", "log", "wildcards"];

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyCatalog,
    EmptyStepName,
    InvalidStepName(String),
    DuplicateStepName(String),
    EmptyCommand(String),
    DuplicateRole { step: String, role: String },
    UnknownWildcard { step: String, wildcard: String },
    ReservedWildcard(String),
    EmptyDomain(String),
    GatherOutput { step: String, role: String },
    GatherWithoutToken { step: String, role: String },
    UnboundWildcard { step: String, path: String, wildcard: String },
    ZeroThreads(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCatalog => write!(f, "Catalog has no steps"),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::InvalidStepName(name) => {
                write!(f, "Step name '{}' may not contain whitespace, '/' or brackets", name)
            }
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::EmptyCommand(step) => write!(f, "Step '{}' has no command specified", step),
            Self::DuplicateRole { step, role } => {
                write!(f, "Step '{}' declares role '{}' more than once", step, role)
            }
            Self::UnknownWildcard { step, wildcard } => {
                write!(f, "Step '{}' uses undeclared wildcard '{}'", step, wildcard)
            }
            Self::ReservedWildcard(name) => {
                write!(f, "Wildcard name '{}' is reserved by the command template syntax", name)
            }
            Self::EmptyDomain(name) => write!(f, "Wildcard '{}' has an empty domain", name),
            Self::GatherOutput { step, role } => {
                write!(f, "Step '{}': output role '{}' cannot be a gather binding", step, role)
            }
            Self::GatherWithoutToken { step, role } => write!(
                f,
                "Step '{}': gather role '{}' does not use its wildcard token",
                step, role
            ),
            Self::UnboundWildcard { step, path, wildcard } => write!(
                f,
                "Step '{}': path '{}' uses wildcard '{{{}}}' which the step does not bind",
                step, path, wildcard
            ),
            Self::ZeroThreads(step) => write!(f, "Step '{}' requests zero threads", step),
        }
    }
}

/// Validates the wildcard declarations.
fn validate_domains(catalog: &Catalog) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (name, domain) in &catalog.wildcards {
        if RESERVED_WILDCARDS.contains(&name.as_str()) {
            errors.push(ValidationError::ReservedWildcard(name.clone()));
        }

        let empty = match domain {
            WildcardDomain::Values(values) => values.is_empty(),
            WildcardDomain::Range { count: Quantity::Literal(0), .. } => true,
            _ => false,
        };
        if empty {
            errors.push(ValidationError::EmptyDomain(name.clone()));
        }
    }

    errors
}

/// Validates a single step's fields.
fn validate_step(step: &StepDefinition, catalog: &Catalog) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let name = step.name.as_str();

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors;
    }
    if name.chars().any(|c| c.is_whitespace() || matches!(c, '/' | '[' | ']' | '{' | '}')) {
        errors.push(ValidationError::InvalidStepName(name.to_string()));
    }

    if step.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(name.to_string()));
    }

    if step.threads == Quantity::Literal(0) {
        errors.push(ValidationError::ZeroThreads(name.to_string()));
    }

    let declared = |wildcard: &str| catalog.wildcards.contains_key(wildcard);

    if let Some(wildcard) = &step.fan_out {
        if !declared(wildcard) {
            errors.push(ValidationError::UnknownWildcard {
                step: name.to_string(),
                wildcard: wildcard.clone(),
            });
        }
    }

    for roles in [&step.inputs, &step.outputs] {
        let mut seen = HashSet::new();
        for role in roles.iter() {
            if !seen.insert(role.name.as_str()) {
                errors.push(ValidationError::DuplicateRole {
                    step: name.to_string(),
                    role: role.name.clone(),
                });
            }
        }
    }

    // Wildcards a plain path expression may use
    let bound: Vec<&str> = step.fan_out.iter().map(String::as_str).collect();
    let check_tokens = |path: &str, extra: Option<&str>, errors: &mut Vec<ValidationError>| {
        for token in extract_wildcard_names(path) {
            if !bound.contains(&token.as_str()) && extra != Some(token.as_str()) {
                errors.push(ValidationError::UnboundWildcard {
                    step: name.to_string(),
                    path: path.to_string(),
                    wildcard: token,
                });
            }
        }
    };

    for role in &step.inputs {
        match &role.binding {
            PathBinding::Single(path) => check_tokens(path, None, &mut errors),
            PathBinding::Gather { gather, over } => {
                if !declared(over) {
                    errors.push(ValidationError::UnknownWildcard {
                        step: name.to_string(),
                        wildcard: over.clone(),
                    });
                }
                if !extract_wildcard_names(gather).iter().any(|t| t == over) {
                    errors.push(ValidationError::GatherWithoutToken {
                        step: name.to_string(),
                        role: role.name.clone(),
                    });
                }
                check_tokens(gather, Some(over), &mut errors);
            }
        }
    }

    for role in &step.outputs {
        match &role.binding {
            PathBinding::Single(path) => check_tokens(path, None, &mut errors),
            PathBinding::Gather { .. } => errors.push(ValidationError::GatherOutput {
                step: name.to_string(),
                role: role.name.clone(),
            }),
        }
    }

    for path in step.log.iter().chain(step.workdir.iter()) {
        check_tokens(path, None, &mut errors);
    }

    // Placeholder mismatches are only worth a warning here; rendering fails hard later
    if step.command.contains("{input}") && step.inputs.is_empty() {
        warn!("Step '{}': command uses {{input}} but no input specified", name);
    }
    if step.command.contains("{output}") && step.outputs.is_empty() {
        warn!("Step '{}': command uses {{output}} but no output specified", name);
    }

    if let Some(wildcard) = &step.fan_out {
        debug!("Step '{}' fans out over '{}'", name, wildcard);
    }

    errors
}

/// Validates the entire catalog.
///
/// All problems are collected and reported together.
pub fn validate_catalog(catalog: &Catalog) -> Result<()> {
    info!(
        "Validating catalog with {} steps and {} wildcards",
        catalog.steps.len(),
        catalog.wildcards.len()
    );

    if catalog.steps.is_empty() {
        return Err(EngineError::Catalog(ValidationError::EmptyCatalog.to_string()));
    }

    let mut errors = validate_domains(catalog);

    let mut seen_names: HashSet<&str> = HashSet::new();
    for step in &catalog.steps {
        if !step.name.trim().is_empty() && !seen_names.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
        errors.extend(validate_step(step, catalog));
    }

    if errors.is_empty() {
        info!("Catalog validation passed");
        return Ok(());
    }

    for error in &errors {
        debug!("Validation error: {}", error);
    }
    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(EngineError::Catalog(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_catalog() -> Catalog {
        Catalog::new().with_wildcard(
            "chunk",
            WildcardDomain::Range { count: Quantity::Literal(2), width: 1 },
        )
    }

    fn errors_for(catalog: &Catalog) -> String {
        match validate_catalog(catalog) {
            Err(EngineError::Catalog(msg)) => msg,
            other => panic!("expected catalog error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_catalog() {
        let catalog = chunk_catalog()
            .with_step(
                StepDefinition::new("align", "align {input.x} > {output.hits}")
                    .with_input("x", "split/{chunk}.fa")
                    .with_output("hits", "hits/{chunk}.tsv")
                    .with_fan_out("chunk"),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("merge", "cat {input.hits} > {output.all}")
                    .with_gather_input("hits", "hits/{chunk}.tsv", "chunk")
                    .with_output("all", "hits/all.tsv"),
            )
            .unwrap();
        assert!(validate_catalog(&catalog).is_ok());
    }

    #[test]
    fn test_empty_catalog() {
        assert!(errors_for(&Catalog::new()).contains("no steps"));
    }

    #[test]
    fn test_empty_command_and_bad_name() {
        let mut catalog = Catalog::new();
        catalog.steps.push(StepDefinition::new("bad name", "  "));
        let msg = errors_for(&catalog);
        assert!(msg.contains("may not contain whitespace"));
        assert!(msg.contains("no command"));
    }

    #[test]
    fn test_duplicate_names_detected() {
        let mut catalog = Catalog::new();
        catalog.steps.push(StepDefinition::new("a", "echo"));
        catalog.steps.push(StepDefinition::new("a", "echo"));
        assert!(errors_for(&catalog).contains("Duplicate step name"));
    }

    #[test]
    fn test_unknown_fan_out_and_gather_wildcards() {
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("a", "echo").with_fan_out("chunk"))
            .unwrap()
            .with_step(
                StepDefinition::new("b", "echo")
                    .with_gather_input("parts", "p/{sample}.txt", "sample"),
            )
            .unwrap();
        let msg = errors_for(&catalog);
        assert!(msg.contains("undeclared wildcard 'chunk'"));
        assert!(msg.contains("undeclared wildcard 'sample'"));
    }

    #[test]
    fn test_unbound_wildcard_in_path() {
        let catalog = chunk_catalog()
            .with_step(StepDefinition::new("a", "echo").with_output("o", "out/{chunk}.txt"))
            .unwrap();
        assert!(errors_for(&catalog).contains("does not bind"));
    }

    #[test]
    fn test_gather_rules() {
        let mut step = StepDefinition::new("a", "echo").with_gather_input("x", "fixed.txt", "chunk");
        step.outputs.push(crate::workflow::model::FileRole {
            name: "o".into(),
            binding: PathBinding::Gather { gather: "o/{chunk}".into(), over: "chunk".into() },
        });
        let catalog = chunk_catalog().with_step(step).unwrap();

        let msg = errors_for(&catalog);
        assert!(msg.contains("does not use its wildcard token"));
        assert!(msg.contains("cannot be a gather binding"));
    }

    #[test]
    fn test_reserved_and_empty_domains() {
        let catalog = Catalog::new()
            .with_wildcard("threads", WildcardDomain::Values(vec!["1".into()]))
            .with_wildcard("none", WildcardDomain::Values(vec![]))
            .with_step(StepDefinition::new("a", "echo"))
            .unwrap();

        let msg = errors_for(&catalog);
        assert!(msg.contains("reserved"));
        assert!(msg.contains("empty domain"));
    }

    #[test]
    fn test_zero_threads_and_duplicate_roles() {
        let step = StepDefinition::new("a", "echo")
            .with_threads(0)
            .with_input("x", "1.txt")
            .with_input("x", "2.txt");
        let catalog = Catalog::new().with_step(step).unwrap();

        let msg = errors_for(&catalog);
        assert!(msg.contains("zero threads"));
        assert!(msg.contains("more than once"));
    }
}
