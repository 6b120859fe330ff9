//! Engine Error Types
//!
//! Every failure the engine can report, grouped by the phase that raises it.
//! Build-time errors (configuration, catalog, graph and template problems)
//! abort a run before any process is launched; runtime errors stay local to
//! the node that produced them.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while loading, expanding, building or running a pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration value needed for expansion or activation is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The step catalog could not be read, parsed or validated.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Two nodes declare the same output path.
    #[error("duplicate producer for '{}': '{first}' and '{second}'", path.display())]
    DuplicateProducer {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Files the graph expects the environment to provide do not exist.
    #[error("missing external input(s): {}", format_paths(paths))]
    MissingExternalInput { paths: Vec<PathBuf> },

    /// A command template references something the node does not declare.
    #[error("template error in step '{step}': {reason}")]
    Template { step: String, reason: String },

    /// A node could not be launched or exited unsuccessfully.
    #[error("node '{node}' failed: {reason}")]
    NodeExecution { node: String, reason: String },

    /// Thread budget accounting went out of bounds.
    #[error("thread budget exhausted: {0}")]
    ResourceExhaustion(String),

    /// The scheduler attempted a status change the node lifecycle forbids.
    #[error("invalid status transition for '{node}': {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns true for errors raised before any node was launched.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Catalog(_)
                | Self::DuplicateProducer { .. }
                | Self::CyclicDependency { .. }
                | Self::MissingExternalInput { .. }
                | Self::Template { .. }
        )
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
