//! Run Report
//!
//! Per-node outcomes and the overall verdict of a run, printable for the CLI
//! and serializable to `<workdir>/.daijin/last_run.json`. The JSON file is
//! for inspection only; the engine never reads it back.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local};
use colored::Colorize;
use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::monitoring::{ExecutionTimeline, TimelineEntry};
use crate::workflow::graph::{Graph, NodeIndex, NodeStatus, SkipReason};
use crate::workflow::planner::NodeMetrics;

/// Final outcome of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    SkippedUpToDate,
    SkippedBestEffortFailure,
    SkippedUnreachable,
    Failed,
    /// Only in cancelled runs
    NotStarted,
}

impl Outcome {
    fn from_status(status: NodeStatus, metrics: &NodeMetrics) -> Self {
        match status {
            NodeStatus::Done if metrics.tolerated_failure => Self::SkippedBestEffortFailure,
            NodeStatus::Done => Self::Succeeded,
            NodeStatus::Skipped(SkipReason::UpToDate) => Self::SkippedUpToDate,
            NodeStatus::Skipped(SkipReason::Unreachable) => Self::SkippedUnreachable,
            NodeStatus::Failed => Self::Failed,
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running => Self::NotStarted,
        }
    }

    /// True for outcomes that satisfy a target.
    pub fn is_satisfactory(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::SkippedUpToDate | Self::SkippedBestEffortFailure
        )
    }

    fn colored_label(&self) -> colored::ColoredString {
        let label = self.to_string();
        match self {
            Self::Succeeded => label.green(),
            Self::SkippedUpToDate => label.cyan(),
            Self::SkippedBestEffortFailure => label.yellow(),
            Self::SkippedUnreachable => label.yellow(),
            Self::Failed => label.red().bold(),
            Self::NotStarted => label.dimmed(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Succeeded => "succeeded",
            Self::SkippedUpToDate => "skipped (up to date)",
            Self::SkippedBestEffortFailure => "skipped (best-effort failure)",
            Self::SkippedUnreachable => "skipped (unreachable)",
            Self::Failed => "failed",
            Self::NotStarted => "not started",
        };
        f.write_str(label)
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    /// The run was cancelled before finishing
    Partial,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// Report line for one node.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub node: String,
    pub step: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    /// Milliseconds between run start and node launch
    pub start_offset_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub log: PathBuf,
    pub error: Option<String>,
    /// Best-effort node exited non-zero but produced its outputs
    pub tolerated_failure: bool,
    pub target: bool,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub started_at: DateTime<Local>,
    pub total_ms: u64,
    pub results: Vec<ExecutionResult>,
}

impl RunSummary {
    /// Derives the summary from the final graph state.
    ///
    /// `targets` are the nodes the run was asked to produce; the verdict is
    /// Success iff none of them ended unsatisfactorily and no node that is
    /// not best-effort failed.
    pub fn from_run(
        graph: &Graph,
        metrics: &[NodeMetrics],
        targets: &HashSet<NodeIndex>,
        run_start: Instant,
        started_at: DateTime<Local>,
        cancelled: bool,
    ) -> Self {
        let results: Vec<ExecutionResult> = graph
            .topological_order()
            .iter()
            .map(|&idx| {
                let node = graph.node(idx);
                let m = &metrics[idx];
                ExecutionResult {
                    node: node.id().to_string(),
                    step: node.id().step.clone(),
                    outcome: Outcome::from_status(node.status(), m),
                    exit_code: m.exit_code,
                    start_offset_ms: m
                        .start_time
                        .map(|t| t.saturating_duration_since(run_start).as_millis() as u64),
                    duration_ms: m.duration_ms.map(|d| d as u64),
                    log: node.log_path.clone(),
                    error: m.error.clone(),
                    tolerated_failure: m.tolerated_failure,
                    target: targets.contains(&idx),
                }
            })
            .collect();

        let failed_required = graph
            .nodes()
            .iter()
            .any(|n| n.status() == NodeStatus::Failed && !n.is_best_effort());
        let targets_met = results
            .iter()
            .filter(|r| r.target)
            .all(|r| r.outcome.is_satisfactory());

        let status = if cancelled {
            RunStatus::Partial
        } else if failed_required || !targets_met {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };

        Self {
            status,
            started_at,
            total_ms: run_start.elapsed().as_millis() as u64,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Number of nodes with the given outcome.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Number of nodes whose process was launched in this run.
    pub fn executed_count(&self) -> usize {
        self.results.iter().filter(|r| r.start_offset_ms.is_some()).count()
    }

    pub fn result(&self, node: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.node == node)
    }

    /// Writes the summary as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        fs::write(path, json)?;
        info!("Saved run summary to {}", path.display());
        Ok(())
    }

    /// Timing chart of every executed node.
    pub fn timeline(&self) -> ExecutionTimeline {
        let mut timeline = ExecutionTimeline::new(self.total_ms);
        for result in &self.results {
            if let (Some(start_ms), Some(duration_ms)) = (result.start_offset_ms, result.duration_ms) {
                timeline.add(TimelineEntry {
                    label: result.node.clone(),
                    start_ms,
                    duration_ms,
                    failed: matches!(
                        result.outcome,
                        Outcome::Failed | Outcome::SkippedBestEffortFailure
                    ),
                });
            }
        }
        timeline
    }

    /// Prints the per-node table, the timeline and the verdict.
    pub fn print(&self) {
        println!();
        println!("{}", "Run summary".bold());
        println!();
        for result in &self.results {
            let target = if result.target { "*" } else { " " };
            println!("  {} {:<28} {}", target, result.node, result.outcome.colored_label());
            if let Some(error) = &result.error {
                println!("      {} (log: {})", error, result.log.display());
            }
        }

        if self.executed_count() > 0 {
            print!("{}", self.timeline().gantt_chart());
        }

        println!();
        println!(
            "{} executed, {} up to date, {} unreachable, {} failed",
            self.count(Outcome::Succeeded) + self.count(Outcome::SkippedBestEffortFailure),
            self.count(Outcome::SkippedUpToDate),
            self.count(Outcome::SkippedUnreachable),
            self.count(Outcome::Failed)
        );

        let verdict = match self.status {
            RunStatus::Success => "Run completed successfully".green().bold(),
            RunStatus::Failure => "Run failed".red().bold(),
            RunStatus::Partial => "Run cancelled; outputs may be partial".yellow().bold(),
        };
        println!("{} in {:.2}s", verdict, self.total_ms as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(node: &str, outcome: Outcome, target: bool) -> ExecutionResult {
        ExecutionResult {
            node: node.to_string(),
            step: node.to_string(),
            outcome,
            exit_code: None,
            start_offset_ms: Some(0),
            duration_ms: Some(5),
            log: PathBuf::from(format!("logs/{}.log", node)),
            error: None,
            tolerated_failure: outcome == Outcome::SkippedBestEffortFailure,
            target,
        }
    }

    fn summary(results: Vec<ExecutionResult>) -> RunSummary {
        RunSummary {
            status: RunStatus::Success,
            started_at: Local::now(),
            total_ms: 10,
            results,
        }
    }

    #[test]
    fn test_outcome_mapping() {
        let mut metrics = NodeMetrics::default();
        assert_eq!(Outcome::from_status(NodeStatus::Done, &metrics), Outcome::Succeeded);
        assert_eq!(
            Outcome::from_status(NodeStatus::Skipped(SkipReason::Unreachable), &metrics),
            Outcome::SkippedUnreachable
        );
        assert_eq!(Outcome::from_status(NodeStatus::Pending, &metrics), Outcome::NotStarted);

        metrics.tolerated_failure = true;
        assert_eq!(
            Outcome::from_status(NodeStatus::Done, &metrics),
            Outcome::SkippedBestEffortFailure
        );
        assert!(Outcome::SkippedBestEffortFailure.is_satisfactory());
        assert!(!Outcome::SkippedUnreachable.is_satisfactory());
    }

    #[test]
    fn test_counts() {
        let s = summary(vec![
            result("a", Outcome::Succeeded, false),
            result("b", Outcome::SkippedUpToDate, false),
            result("c", Outcome::Succeeded, true),
        ]);
        assert_eq!(s.count(Outcome::Succeeded), 2);
        assert_eq!(s.result("b").unwrap().outcome, Outcome::SkippedUpToDate);
        assert_eq!(s.timeline().entries().len(), 3);
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".daijin/last_run.json");
        summary(vec![result("a", Outcome::SkippedBestEffortFailure, true)])
            .save(&path)
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["results"][0]["outcome"], "skipped_best_effort_failure");
        assert_eq!(value["results"][0]["target"], true);
    }
}
