//! Workflow Definition Module
//!
//! Everything between a step catalog on disk and a schedulable graph.
//!
//! # Structure
//!
//! - [`model`]: Step definitions, wildcard domains and activation predicates
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Static catalog checks
//! - [`wildcards`]: Expansion of steps into concrete instances
//! - [`graph`]: Dependency graph derived from file paths
//! - [`state`]: Output freshness checks
//! - [`planner`]: Node lifecycle and thread budget accounting

pub mod graph;
pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;
pub mod wildcards;

pub use graph::{Graph, GraphNode, NodeIndex, NodeStatus, SkipReason};
pub use model::{Activation, Catalog, StepDefinition, WildcardDomain};
pub use parser::{load_catalog, parse_catalog};
pub use planner::{Budget, ExecutionPlanner};
pub use state::{FsOutputState, OutputState};
pub use validator::validate_catalog;
pub use wildcards::{expand, InstanceId, StepInstance};
