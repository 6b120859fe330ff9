//! Run Monitoring
//!
//! Timing visualisation for finished runs.

pub mod timeline;

pub use timeline::{ExecutionTimeline, TimelineEntry};
