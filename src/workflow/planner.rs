//! Execution Planner
//!
//! Owns the graph during a run and decides what may start next:
//! - Promotes pending nodes once every predecessor is terminal
//! - Cascades unreachable skips below failed nodes
//! - Accounts job slots and the global thread budget
//! - Records per-node timing for the run report
//!
//! The planner never touches processes; the engine launches what the planner
//! hands out and reports back through the `mark_*` methods.

use std::collections::HashSet;
use std::time::Instant;

use log::{debug, info, warn};

use crate::error::{EngineError, Result};

use super::graph::{Graph, NodeIndex, NodeStatus, SkipReason};
use super::state::OutputState;

/// Concurrency limits for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Maximum number of concurrently running nodes
    pub jobs: usize,
    /// Maximum sum of thread allocations of running nodes
    pub threads: usize,
}

impl Budget {
    pub fn new(jobs: usize, threads: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            threads: threads.max(1),
        }
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(4, num_cpus::get())
    }
}

/// Execution metrics for a single node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    /// When the node was launched
    pub start_time: Option<Instant>,
    /// Duration in milliseconds
    pub duration_ms: Option<u128>,
    /// Process exit code, when the process ran to completion
    pub exit_code: Option<i32>,
    /// Best-effort node failed but left its outputs behind
    pub tolerated_failure: bool,
    /// Failure description
    pub error: Option<String>,
}

/// Tracks node status and resources during a run.
pub struct ExecutionPlanner {
    graph: Graph,
    budget: Budget,
    threads_in_use: usize,
    running: HashSet<NodeIndex>,
    executed: HashSet<NodeIndex>,
    metrics: Vec<NodeMetrics>,
    cancelled: bool,
}

impl ExecutionPlanner {
    /// Creates a planner for a built graph.
    ///
    /// Thread requirements above the budget should already be clamped with
    /// [`Graph::clamp_threads`]; oversize nodes are never launched otherwise.
    pub fn new(graph: Graph, budget: Budget) -> Self {
        info!(
            "Creating planner: {} nodes, {} max jobs, {} threads",
            graph.len(),
            budget.jobs,
            budget.threads
        );

        let metrics = vec![NodeMetrics::default(); graph.len()];
        Self {
            graph,
            budget,
            threads_in_use: 0,
            running: HashSet::new(),
            executed: HashSet::new(),
            metrics,
            cancelled: false,
        }
    }

    /// Promotes pending nodes whose predecessors are all terminal, repeating
    /// until nothing changes so skips cascade through the graph.
    ///
    /// Returns the nodes that changed status.
    pub fn promote(&mut self, state: &dyn OutputState) -> Result<Vec<NodeIndex>> {
        let mut changed = Vec::new();

        loop {
            let mut progressed = false;

            for pos in 0..self.graph.topological_order().len() {
                let idx = self.graph.topological_order()[pos];
                if self.graph.status(idx) != NodeStatus::Pending {
                    continue;
                }

                let preds = self.graph.predecessors(idx);
                if !preds.iter().all(|&p| self.graph.status(p).is_terminal()) {
                    continue;
                }

                let blocked = preds.iter().any(|&p| {
                    matches!(
                        self.graph.status(p),
                        NodeStatus::Failed | NodeStatus::Skipped(SkipReason::Unreachable)
                    )
                });
                let upstream_ran = preds.iter().any(|&p| self.was_executed(p));

                let next = if blocked {
                    NodeStatus::Skipped(SkipReason::Unreachable)
                } else if !upstream_ran && state.is_satisfied(self.graph.node(idx)) {
                    NodeStatus::Skipped(SkipReason::UpToDate)
                } else {
                    NodeStatus::Ready
                };

                match next {
                    NodeStatus::Skipped(SkipReason::Unreachable) => {
                        warn!("Skipping '{}': an upstream node failed", self.graph.node(idx).id())
                    }
                    NodeStatus::Skipped(SkipReason::UpToDate) => {
                        info!("'{}' is up to date", self.graph.node(idx).id())
                    }
                    _ => debug!("'{}' is ready", self.graph.node(idx).id()),
                }

                self.graph.transition(idx, next)?;
                changed.push(idx);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        Ok(changed)
    }

    /// Returns the next ready node that fits the free job slots and threads,
    /// in topological order. None once cancelled.
    pub fn next_launchable(&self) -> Option<NodeIndex> {
        if self.cancelled || self.running.len() >= self.budget.jobs {
            return None;
        }

        let free_threads = self.budget.threads.saturating_sub(self.threads_in_use);
        self.graph.topological_order().iter().copied().find(|&idx| {
            self.graph.status(idx) == NodeStatus::Ready && self.graph.node(idx).threads <= free_threads
        })
    }

    /// Marks a node as running and acquires its threads.
    pub fn mark_running(&mut self, idx: NodeIndex) -> Result<()> {
        let threads = self.graph.node(idx).threads;
        if self.running.len() >= self.budget.jobs {
            return Err(EngineError::ResourceExhaustion(format!(
                "launching '{}' would exceed {} job slots",
                self.graph.node(idx).id(),
                self.budget.jobs
            )));
        }
        if self.threads_in_use + threads > self.budget.threads {
            return Err(EngineError::ResourceExhaustion(format!(
                "launching '{}' needs {} threads, only {} of {} free",
                self.graph.node(idx).id(),
                threads,
                self.budget.threads - self.threads_in_use,
                self.budget.threads
            )));
        }

        self.graph.transition(idx, NodeStatus::Running)?;
        self.threads_in_use += threads;
        self.running.insert(idx);
        self.executed.insert(idx);
        self.metrics[idx].start_time = Some(Instant::now());

        debug!(
            "'{}' started using {} threads (total: {}/{})",
            self.graph.node(idx).id(),
            threads,
            self.threads_in_use,
            self.budget.threads
        );
        Ok(())
    }

    /// Marks a running node as done. `tolerated` records a best-effort
    /// failure whose outputs were all present.
    pub fn mark_done(&mut self, idx: NodeIndex, exit_code: Option<i32>, tolerated: bool) -> Result<()> {
        self.graph.transition(idx, NodeStatus::Done)?;
        self.release(idx)?;

        let metrics = &mut self.metrics[idx];
        metrics.exit_code = exit_code;
        metrics.tolerated_failure = tolerated;
        Ok(())
    }

    /// Marks a running node as failed. Successors are skipped on the next
    /// [`promote`](Self::promote).
    pub fn mark_failed(&mut self, idx: NodeIndex, exit_code: Option<i32>, error: String) -> Result<()> {
        self.graph.transition(idx, NodeStatus::Failed)?;
        self.release(idx)?;

        let metrics = &mut self.metrics[idx];
        metrics.exit_code = exit_code;
        metrics.error = Some(error);
        Ok(())
    }

    fn release(&mut self, idx: NodeIndex) -> Result<()> {
        let threads = self.graph.node(idx).threads;
        if !self.running.remove(&idx) {
            return Err(EngineError::ResourceExhaustion(format!(
                "'{}' released resources it never held",
                self.graph.node(idx).id()
            )));
        }
        self.threads_in_use = self.threads_in_use.checked_sub(threads).ok_or_else(|| {
            EngineError::ResourceExhaustion(format!(
                "thread count underflow releasing '{}'",
                self.graph.node(idx).id()
            ))
        })?;

        let metrics = &mut self.metrics[idx];
        if let Some(start) = metrics.start_time {
            metrics.duration_ms = Some(start.elapsed().as_millis());
        }

        debug!(
            "'{}' released {} threads (total: {}/{})",
            self.graph.node(idx).id(),
            threads,
            self.threads_in_use,
            self.budget.threads
        );
        Ok(())
    }

    /// Stops handing out new work.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True while something is running or could still be launched.
    pub fn has_work_remaining(&self) -> bool {
        !self.running.is_empty() || (!self.cancelled && self.has_ready())
    }

    fn has_ready(&self) -> bool {
        (0..self.graph.len()).any(|i| self.graph.status(i) == NodeStatus::Ready)
    }

    /// Returns the current progress as (terminal, total).
    pub fn progress(&self) -> (usize, usize) {
        let terminal = (0..self.graph.len())
            .filter(|&i| self.graph.status(i).is_terminal())
            .count();
        (terminal, self.graph.len())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn threads_in_use(&self) -> usize {
        self.threads_in_use
    }

    /// True if the node was launched during this run.
    pub fn was_executed(&self, idx: NodeIndex) -> bool {
        self.executed.contains(&idx)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Returns metrics for all nodes, indexed like the graph.
    pub fn metrics(&self) -> &[NodeMetrics] {
        &self.metrics
    }

    /// Consumes the planner, handing back the final graph and metrics.
    pub fn finish(self) -> (Graph, Vec<NodeMetrics>) {
        (self.graph, self.metrics)
    }
}
