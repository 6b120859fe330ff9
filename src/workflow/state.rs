//! Output State
//!
//! Decides whether a node's outputs are already present and fresh enough to
//! skip the node. The filesystem is the only state: nothing is persisted
//! between runs, so deleting an output is all it takes to force a rebuild.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use log::debug;

use super::graph::GraphNode;

/// Freshness oracle consulted by the scheduler.
pub trait OutputState: Send + Sync {
    /// True iff every declared output exists, every input exists, and no
    /// output is older than the newest input.
    fn is_satisfied(&self, node: &GraphNode) -> bool;

    /// True iff every declared output exists, regardless of age.
    fn outputs_present(&self, node: &GraphNode) -> bool;
}

/// Modification-time based freshness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOutputState;

impl FsOutputState {
    pub fn new() -> Self {
        Self
    }
}

impl OutputState for FsOutputState {
    fn is_satisfied(&self, node: &GraphNode) -> bool {
        let mut oldest_output: Option<SystemTime> = None;
        for path in node.output_paths() {
            match modified(path) {
                Some(time) => {
                    oldest_output = Some(oldest_output.map_or(time, |o| o.min(time)));
                }
                None => {
                    debug!("'{}': output {} missing", node.id(), path.display());
                    return false;
                }
            }
        }

        let mut newest_input: Option<SystemTime> = None;
        for path in node.input_paths() {
            match modified(path) {
                Some(time) => {
                    newest_input = Some(newest_input.map_or(time, |n| n.max(time)));
                }
                None => {
                    debug!("'{}': input {} missing", node.id(), path.display());
                    return false;
                }
            }
        }

        match (oldest_output, newest_input) {
            (Some(out), Some(input)) if out < input => {
                debug!("'{}': outputs older than inputs", node.id());
                false
            }
            _ => true,
        }
    }

    fn outputs_present(&self, node: &GraphNode) -> bool {
        node.output_paths().all(|p| p.exists())
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
