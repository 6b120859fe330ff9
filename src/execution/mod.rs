//! Workflow Execution Module
//!
//! Runs a prepared graph: command rendering, process launch, parallel
//! scheduling within the thread budget, and run reporting.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating runs
//! - [`step`]: Launching a single node's process
//! - [`template`]: Command template rendering
//! - [`report`]: Per-node outcomes and the run verdict

pub mod engine;
pub mod report;
pub mod step;
pub mod template;

pub use crate::workflow::planner::Budget;
pub use engine::{DryRunPlan, Engine, STATE_DIR};
pub use report::{Outcome, RunStatus, RunSummary};
pub use template::RenderedCommand;
