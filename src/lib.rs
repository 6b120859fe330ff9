//! Daijin - Declarative Task-Graph Execution Engine
//!
//! Runs pipelines of shell steps declared in a YAML catalog. Steps name the
//! files they read and write; the engine derives the dependency graph from
//! those paths, fans steps out over wildcard domains, skips work whose
//! outputs are already fresh, and runs the rest in parallel within a thread
//! budget.
//!
//! # Architecture
//!
//! - [`config`]: Run configuration values
//! - [`workflow`]: Catalog model, parsing, expansion and graph building
//! - [`execution`]: Execution engine with parallel scheduling
//! - [`monitoring`]: Execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use daijin::config::RunConfig;
//! use daijin::execution::Engine;
//! use daijin::load_catalog;
//!
//! #[tokio::main]
//! async fn main() -> daijin::Result<()> {
//!     let catalog = load_catalog("daijin.yaml")?;
//!     let config = RunConfig::load("config.yaml")?;
//!
//!     let mut engine = Engine::new(catalog, config);
//!     engine.set_working_dir("/data/analysis");
//!
//!     let summary = engine.run(&[]).await?;
//!     summary.print();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::RunConfig;
pub use error::{EngineError, Result};
pub use execution::engine::Engine;
pub use workflow::model::{Catalog, StepDefinition};
pub use workflow::parser::load_catalog;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Daijin";
