//! Execution Engine
//!
//! Orchestrates a run end to end:
//! 1. Expands the catalog under the run configuration
//! 2. Builds the dependency graph and restricts it to the requested targets
//! 3. Clamps thread requirements, checks external inputs, pre-renders every
//!    command (nothing launches if any of this fails)
//! 4. Drives the planner: launches ready nodes as tokio tasks within the
//!    job and thread budget, and feeds completions back
//! 5. Produces a [`RunSummary`]
//!
//! All graph mutation happens in the scheduling loop; spawned tasks only run
//! processes and report how they ended.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use colored::Colorize;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::RunConfig;
use crate::error::{EngineError, Result};
use crate::workflow::graph::{Graph, NodeIndex};
use crate::workflow::model::Catalog;
use crate::workflow::planner::{Budget, ExecutionPlanner};
use crate::workflow::state::{FsOutputState, OutputState};
use crate::workflow::wildcards::expand;

use super::report::RunSummary;
use super::step::{execute_node, NodeJob, NodeOutcome};
use super::template::{render_all, RenderedCommand};

/// Engine bookkeeping directory inside the working directory.
pub const STATE_DIR: &str = ".daijin";

/// A graph ready to schedule: every check passed, every command rendered.
#[derive(Debug)]
pub struct PreparedRun {
    pub graph: Graph,
    /// Rendered commands, indexed like the graph
    pub commands: Vec<RenderedCommand>,
    /// Nodes the run must produce
    pub targets: HashSet<NodeIndex>,
}

/// What a dry run predicts for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Run,
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub node: String,
    pub action: PlannedAction,
    pub command: RenderedCommand,
}

/// Dry-run result in execution order.
#[derive(Debug, Clone)]
pub struct DryRunPlan {
    pub nodes: Vec<PlannedNode>,
}

impl DryRunPlan {
    /// Number of nodes that would be launched.
    pub fn run_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.action == PlannedAction::Run).count()
    }

    pub fn print(&self) {
        for planned in &self.nodes {
            match planned.action {
                PlannedAction::UpToDate => {
                    println!("{} {}", "[UP TO DATE]".cyan(), planned.node);
                }
                PlannedAction::Run => {
                    println!();
                    println!("{} {}", "[DRY RUN]".yellow().bold(), planned.node);
                    if let Some(message) = &planned.command.message {
                        println!("  Message: {}", message);
                    }
                    println!("  Command: {}", planned.command.script);
                    println!("  Threads: {}", planned.command.threads);
                    println!("  Workdir: {}", planned.command.working_dir.display());
                    println!("  Log:     {}", planned.command.log_path.display());
                }
            }
        }
        println!();
        println!(
            "{} of {} nodes would run",
            self.run_count(),
            self.nodes.len()
        );
    }
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use daijin::config::RunConfig;
/// use daijin::execution::{Budget, Engine};
/// use daijin::workflow::parser::load_catalog;
///
/// # async fn demo() -> daijin::Result<()> {
/// let catalog = load_catalog("daijin.yaml")?;
/// let config = RunConfig::load("config.yaml")?;
///
/// let mut engine = Engine::new(catalog, config);
/// engine.set_budget(Budget::new(4, 16));
/// engine.set_working_dir("/data/analysis");
///
/// let summary = engine.run(&[]).await?;
/// summary.print();
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    catalog: Catalog,
    config: RunConfig,
    budget: Budget,
    working_dir: PathBuf,
    state: Arc<dyn OutputState>,
    cancel: watch::Receiver<bool>,
}

impl Engine {
    /// Creates an engine. The working directory defaults to the configured
    /// `workdir`, else the current directory.
    pub fn new(catalog: Catalog, config: RunConfig) -> Self {
        let working_dir = config.workdir().unwrap_or_else(|| PathBuf::from("."));
        let (_, cancel) = watch::channel(false);

        Self {
            catalog,
            config,
            budget: Budget::default(),
            working_dir,
            state: Arc::new(FsOutputState::new()),
            cancel,
        }
    }

    pub fn set_budget(&mut self, budget: Budget) {
        self.budget = budget;
    }

    /// Sets the run working directory; relative paths resolve against it.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = dir.into();
    }

    /// Replaces the freshness oracle.
    pub fn set_output_state(&mut self, state: Arc<dyn OutputState>) {
        self.state = state;
    }

    /// Returns a sender that cancels the run when `true` is sent.
    pub fn cancellation(&mut self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancel = rx;
        tx
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The working directory as an absolute path.
    pub fn working_dir(&self) -> Result<PathBuf> {
        if self.working_dir.is_absolute() {
            Ok(self.working_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.working_dir))
        }
    }

    /// Engine bookkeeping directory (`<workdir>/.daijin`).
    pub fn state_dir(&self) -> Result<PathBuf> {
        Ok(self.working_dir()?.join(STATE_DIR))
    }

    fn build_graph(&self) -> Result<Graph> {
        let instances = expand(&self.catalog, &self.config)?;
        Graph::build(instances, &self.working_dir()?)
    }

    /// Runs every build-time step. Nothing is launched.
    pub fn prepare(&self, targets: &[String]) -> Result<PreparedRun> {
        let mut graph = self.build_graph()?.restrict_to(targets)?;
        graph.clamp_threads(self.budget.threads);
        graph.check_external_inputs()?;
        let commands = render_all(&graph)?;

        let targets: HashSet<NodeIndex> = if targets.is_empty() {
            graph.terminal_nodes().into_iter().collect()
        } else {
            targets.iter().flat_map(|t| graph.resolve_target(t)).collect()
        };

        info!(
            "Prepared {} nodes ({} targets, {} external inputs)",
            graph.len(),
            targets.len(),
            graph.external_inputs().len()
        );

        Ok(PreparedRun {
            graph,
            commands,
            targets,
        })
    }

    /// Predicts which nodes a run would launch, without launching anything.
    pub fn plan(&self, targets: &[String]) -> Result<DryRunPlan> {
        let prepared = self.prepare(targets)?;
        let graph = &prepared.graph;

        let mut would_run = vec![false; graph.len()];
        let mut nodes = Vec::with_capacity(graph.len());

        for &idx in graph.topological_order() {
            let upstream_runs = graph.predecessors(idx).iter().any(|&p| would_run[p]);
            would_run[idx] = upstream_runs || !self.state.is_satisfied(graph.node(idx));

            nodes.push(PlannedNode {
                node: graph.node(idx).id().to_string(),
                action: if would_run[idx] {
                    PlannedAction::Run
                } else {
                    PlannedAction::UpToDate
                },
                command: prepared.commands[idx].clone(),
            });
        }

        Ok(DryRunPlan { nodes })
    }

    /// Executes the graph for `targets` (all terminal nodes when empty).
    ///
    /// Build-time problems come back as `Err` before anything runs. Node
    /// failures do not: they are reported in the returned summary.
    pub async fn run(&self, targets: &[String]) -> Result<RunSummary> {
        let PreparedRun {
            graph,
            commands,
            targets,
        } = self.prepare(targets)?;

        let workdir = self.working_dir()?;
        fs::create_dir_all(&workdir)?;
        let script_dir = self.state_dir()?.join("scripts");

        let run_start = Instant::now();
        let started_at = Local::now();
        info!(
            "Starting execution of {} nodes (jobs: {}, threads: {})",
            graph.len(),
            self.budget.jobs,
            self.budget.threads
        );

        let mut planner = ExecutionPlanner::new(graph, self.budget);
        let mut tasks: JoinSet<(NodeIndex, Result<NodeOutcome>)> = JoinSet::new();
        let mut cancel = self.cancel.clone();
        let mut cancel_open = true;

        loop {
            planner.promote(self.state.as_ref())?;

            if !planner.is_cancelled() && *cancel.borrow() {
                warn!("Cancellation requested; stopping {} running node(s)", planner.running_count());
                planner.cancel();
            }

            while let Some(idx) = planner.next_launchable() {
                planner.mark_running(idx)?;
                let node = planner.graph().node(idx);
                let command = commands[idx].clone();

                info!("Starting: {}", node.id());
                if let Some(message) = &command.message {
                    info!("  {}", message);
                }

                let job = NodeJob {
                    index: idx,
                    name: node.id().to_string(),
                    stem: node.id().file_stem(),
                    outputs: node.output_paths().cloned().collect(),
                    script_dir: script_dir.clone(),
                    command,
                };
                let rx = cancel.clone();
                tasks.spawn(async move {
                    let result = execute_node(&job, rx).await;
                    (job.index, result)
                });
            }

            if !planner.has_work_remaining() {
                break;
            }
            if tasks.is_empty() {
                return Err(EngineError::ResourceExhaustion(
                    "ready nodes remain but none fits the budget".to_string(),
                ));
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, result))) => {
                        self.complete(&mut planner, idx, result)?;
                        let (finished, total) = planner.progress();
                        debug!("Progress: {}/{} nodes finished", finished, total);
                    }
                    Some(Err(e)) => {
                        return Err(EngineError::NodeExecution {
                            node: "<task>".to_string(),
                            reason: format!("execution task aborted: {}", e),
                        })
                    }
                    None => {}
                },
                changed = cancel.changed(), if cancel_open && !planner.is_cancelled() => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
            }
        }

        let cancelled = planner.is_cancelled();
        let (graph, metrics) = planner.finish();
        let summary = RunSummary::from_run(&graph, &metrics, &targets, run_start, started_at, cancelled);

        if let Err(e) = summary.save(&self.state_dir()?.join("last_run.json")) {
            warn!("Could not write run summary: {}", e);
        }

        info!("Run finished with status: {}", summary.status);
        Ok(summary)
    }

    /// Applies a finished node's outcome to the planner.
    fn complete(
        &self,
        planner: &mut ExecutionPlanner,
        idx: NodeIndex,
        result: Result<NodeOutcome>,
    ) -> Result<()> {
        let node = planner.graph().node(idx);
        let name = node.id().to_string();
        let best_effort = node.is_best_effort();

        match result {
            Ok(outcome) if outcome.success => {
                info!("Finished: {} ({:.2?})", name, outcome.elapsed);
                planner.mark_done(idx, outcome.exit_code, false)
            }
            Ok(outcome) if outcome.cancelled => {
                warn!("Cancelled: {}", name);
                planner.mark_failed(idx, None, "cancelled".to_string())
            }
            Ok(outcome) => {
                let code = outcome
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());

                if best_effort && self.state.outputs_present(node) {
                    warn!(
                        "Best-effort node '{}' exited with {} but left its outputs; continuing",
                        name, code
                    );
                    planner.mark_done(idx, outcome.exit_code, true)
                } else {
                    error!("Failed: {} (exit {})", name, code);
                    planner.mark_failed(idx, outcome.exit_code, format!("exit code {}", code))
                }
            }
            Err(e) => {
                error!("Failed: {}: {}", name, e);
                planner.mark_failed(idx, None, e.to_string())
            }
        }
    }

    /// Removes every declared output and log of the active graph, plus the
    /// engine bookkeeping directory. External inputs are never touched.
    ///
    /// Returns the removed paths.
    pub fn clean(&self) -> Result<Vec<PathBuf>> {
        let graph = self.build_graph()?;
        let workdir = self.working_dir()?;
        let mut removed = Vec::new();

        let candidates = graph
            .nodes()
            .iter()
            .flat_map(|n| n.output_paths().chain(std::iter::once(&n.log_path)));

        for path in candidates {
            if !is_removable(path, &workdir, &graph) {
                debug!("Not removing {}", path.display());
                continue;
            }
            if remove_path(path)? {
                debug!("Removed {}", path.display());
                removed.push(path.clone());
            }
        }

        let state_dir = self.state_dir()?;
        if remove_path(&state_dir)? {
            removed.push(state_dir);
        }

        info!("Clean removed {} path(s)", removed.len());
        Ok(removed)
    }
}

/// A path may be cleaned unless it is, or contains, the working directory,
/// or is an external input.
fn is_removable(path: &Path, workdir: &Path, graph: &Graph) -> bool {
    !workdir.starts_with(path) && !graph.external_inputs().contains(path)
}

fn remove_path(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path)?;
            Ok(true)
        }
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::report::{Outcome, RunStatus};
    use crate::workflow::model::{Activation, Quantity, StepDefinition, WildcardDomain};
    use crate::workflow::wildcards::InstanceId;
    use std::time::Duration;
    use tempfile::tempdir;

    fn engine(catalog: Catalog, config: RunConfig, dir: &Path) -> Engine {
        let mut engine = Engine::new(catalog, config);
        engine.set_working_dir(dir);
        engine.set_budget(Budget::new(4, 4));
        engine
    }

    /// prepare -> split -> align[1..3] -> align_all -> finalize
    fn scenario_catalog() -> Catalog {
        Catalog::new()
            .with_wildcard(
                "chunk",
                WildcardDomain::Range {
                    count: Quantity::Config { config: "chunks".into(), default: None },
                    width: 1,
                },
            )
            .with_step(
                StepDefinition::new("prepare", "cp {input.genome} {output.fasta}")
                    .with_input("genome", "genome.fa")
                    .with_output("fasta", "prepared.fa"),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("split", "mkdir -p split && cat {input.fasta} > {output.done}")
                    .with_input("fasta", "prepared.fa")
                    .with_output("done", "split/done"),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("align", "echo hit-{wildcards.chunk} > {output.hits}")
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
            .with_step(
                StepDefinition::new("finalize", "wc -l < {input.merged} > {output.report}")
                    .with_input("merged", "align/all.tsv")
                    .with_output("report", "final.txt"),
            )
            .unwrap()
    }

    fn executed(summary: &RunSummary) -> Vec<String> {
        summary
            .results
            .iter()
            .filter(|r| r.outcome == Outcome::Succeeded)
            .map(|r| r.node.clone())
            .collect()
    }

    /// Pushes a file's mtime into the past so later writes are strictly newer.
    fn age(path: &Path, seconds: u64) {
        let time = std::time::SystemTime::now() - Duration::from_secs(seconds);
        fs::File::options().write(true).open(path).unwrap().set_modified(time).unwrap();
    }

    #[tokio::test]
    async fn test_scenario_runs_then_skips() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), ">chr1\nACGT\n").unwrap();
        age(&dir.path().join("genome.fa"), 3600);
        let config = RunConfig::from_yaml_str("chunks: 3").unwrap();
        let engine = engine(scenario_catalog(), config, dir.path());

        let first = engine.run(&[]).await.unwrap();
        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.count(Outcome::Succeeded), 7);
        assert_eq!(fs::read_to_string(dir.path().join("final.txt")).unwrap().trim(), "3");
        assert!(dir.path().join(".daijin/last_run.json").exists());
        assert!(dir.path().join("logs/align_2.log").exists());

        let second = engine.run(&[]).await.unwrap();
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.executed_count(), 0);
        assert_eq!(second.count(Outcome::SkippedUpToDate), 7);
    }

    #[tokio::test]
    async fn test_deleted_chunk_reruns_only_downstream() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), ">chr1\nACGT\n").unwrap();
        age(&dir.path().join("genome.fa"), 3600);
        let config = RunConfig::from_yaml_str("chunks: 3").unwrap();
        let engine = engine(scenario_catalog(), config, dir.path());

        engine.run(&[]).await.unwrap();
        fs::remove_file(dir.path().join("align/2.tsv")).unwrap();

        let rerun = engine.run(&[]).await.unwrap();
        let mut ran = executed(&rerun);
        ran.sort();
        assert_eq!(ran, vec!["align[chunk=2]", "align_all", "finalize"]);
        assert_eq!(rerun.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("a", "exit 1").with_output("o", "a.txt"))
            .unwrap()
            .with_step(
                StepDefinition::new("b", "cp {input.i} {output.o}")
                    .with_input("i", "a.txt")
                    .with_output("o", "b.txt"),
            )
            .unwrap()
            .with_step(StepDefinition::new("c", "touch {output.o}").with_output("o", "c.txt"))
            .unwrap()
            .with_step(
                StepDefinition::new("d", "cp {input.i} {output.o}")
                    .with_input("i", "c.txt")
                    .with_output("o", "d.txt"),
            )
            .unwrap();

        let summary = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap();

        assert_eq!(summary.status, RunStatus::Failure);
        assert_eq!(summary.result("a").unwrap().outcome, Outcome::Failed);
        assert_eq!(summary.result("a").unwrap().exit_code, Some(1));
        assert_eq!(summary.result("b").unwrap().outcome, Outcome::SkippedUnreachable);
        assert_eq!(summary.result("d").unwrap().outcome, Outcome::Succeeded);
        assert!(dir.path().join("d.txt").exists());
    }

    #[tokio::test]
    async fn test_best_effort_failure_tolerated() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("flaky", "touch {output.o}; exit 2")
                    .with_output("o", "partial.txt")
                    .as_best_effort(),
            )
            .unwrap()
            .with_step(
                StepDefinition::new("after", "cp {input.i} {output.o}")
                    .with_input("i", "partial.txt")
                    .with_output("o", "after.txt"),
            )
            .unwrap();

        let summary = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap();

        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(
            summary.result("flaky").unwrap().outcome,
            Outcome::SkippedBestEffortFailure
        );
        assert_eq!(summary.result("after").unwrap().outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn test_best_effort_without_outputs_fails() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("flaky", "exit 2")
                    .with_output("o", "never.txt")
                    .as_best_effort(),
            )
            .unwrap();

        let summary = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap();
        assert_eq!(summary.result("flaky").unwrap().outcome, Outcome::Failed);
        assert_eq!(summary.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_activation_toggles_subgraph() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("blastx", "echo hit > {output.hits}")
                    .with_output("hits", "hits.tsv")
                    .with_activation(Activation::NonEmpty("prot_db".into())),
            )
            .unwrap()
            .with_step(StepDefinition::new("base", "touch {output.o}").with_output("o", "base.txt"))
            .unwrap();

        let off = RunConfig::from_yaml_str("prot_db: ''").unwrap();
        let summary = engine(catalog.clone(), off, dir.path()).run(&[]).await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert!(!dir.path().join("hits.tsv").exists());

        let on = RunConfig::from_yaml_str("prot_db: sprot.fa").unwrap();
        let summary = engine(catalog, on, dir.path()).run(&[]).await.unwrap();
        assert_eq!(summary.results.len(), 2);
        assert!(dir.path().join("hits.tsv").exists());
    }

    #[tokio::test]
    async fn test_thread_budget_limits_concurrency() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::new();
        for name in ["w1", "w2", "w3", "w4"] {
            catalog
                .add_step(
                    StepDefinition::new(
                        name,
                        "echo start >> events.txt; sleep 0.3; echo end >> events.txt; touch {output.o}",
                    )
                    .with_output("o", format!("{}.done", name))
                    .with_threads(2),
                )
                .unwrap();
        }

        let summary = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap();
        assert!(summary.is_success());

        let events = fs::read_to_string(dir.path().join("events.txt")).unwrap();
        let mut running = 0i32;
        let mut peak = 0i32;
        for line in events.lines() {
            running += if line == "start" { 1 } else { -1 };
            peak = peak.max(running);
        }
        // 4 threads, 2 per node
        assert_eq!(peak, 2);
    }

    #[tokio::test]
    async fn test_oversized_thread_request_clamped() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("big", "echo {threads} > {output.o}")
                    .with_output("o", "threads.txt")
                    .with_threads(64),
            )
            .unwrap();

        let summary = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(fs::read_to_string(dir.path().join("threads.txt")).unwrap(), "4\n");
    }

    #[tokio::test]
    async fn test_build_errors_launch_nothing() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("ok", "touch {output.o}").with_output("o", "ok.txt"))
            .unwrap()
            .with_step(StepDefinition::new("bad", "echo {params.missing}"))
            .unwrap();

        let err = engine(catalog, RunConfig::new(), dir.path()).run(&[]).await.unwrap_err();
        assert!(err.is_build_error());
        assert!(!dir.path().join("ok.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_external_input() {
        let dir = tempdir().unwrap();
        let config = RunConfig::from_yaml_str("chunks: 2").unwrap();
        let err = engine(scenario_catalog(), config, dir.path())
            .run(&[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingExternalInput { .. }));
    }

    #[tokio::test]
    async fn test_target_restriction() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), ">chr1\nACGT\n").unwrap();
        let config = RunConfig::from_yaml_str("chunks: 3").unwrap();
        let engine = engine(scenario_catalog(), config, dir.path());

        let summary = engine.run(&["align/1.tsv".to_string()]).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.results.len(), 3);
        assert!(dir.path().join("align/1.tsv").exists());
        assert!(!dir.path().join("align/2.tsv").exists());
        assert!(summary.result("align[chunk=1]").unwrap().target);
    }

    #[tokio::test]
    async fn test_cancellation_yields_partial() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("slow", "sleep 30; touch {output.o}").with_output("o", "slow.txt"))
            .unwrap()
            .with_step(
                StepDefinition::new("next", "cp {input.i} {output.o}")
                    .with_input("i", "slow.txt")
                    .with_output("o", "next.txt"),
            )
            .unwrap();

        let mut engine = engine(catalog, RunConfig::new(), dir.path());
        let cancel = engine.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cancel.send(true);
        });

        let summary = tokio::time::timeout(Duration::from_secs(10), engine.run(&[]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.result("slow").unwrap().outcome, Outcome::Failed);
        assert_eq!(summary.result("slow").unwrap().error.as_deref(), Some("cancelled"));
        assert_eq!(summary.result("next").unwrap().outcome, Outcome::SkippedUnreachable);
    }

    #[tokio::test]
    async fn test_cancellation_stops_nested_tools() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(
                StepDefinition::new("nested", "bash -c 'sleep 1.5; touch late.txt'; touch {output.o}")
                    .with_output("o", "nested.txt"),
            )
            .unwrap();

        let mut engine = engine(catalog, RunConfig::new(), dir.path());
        let cancel = engine.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cancel.send(true);
        });

        let summary = tokio::time::timeout(Duration::from_secs(10), engine.run(&[]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RunStatus::Partial);

        // An orphaned inner shell would have written by now
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("late.txt").exists());
        assert!(!dir.path().join("nested.txt").exists());
    }

    #[tokio::test]
    async fn test_step_without_outputs_is_idempotent() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new()
            .with_step(StepDefinition::new("seed", "echo 1 > {output.o}").with_output("o", "seed.txt"))
            .unwrap()
            .with_step(StepDefinition::new("notify", "echo ran >> ran.txt").with_input("i", "seed.txt"))
            .unwrap();
        let engine = engine(catalog, RunConfig::new(), dir.path());

        let first = engine.run(&[]).await.unwrap();
        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.executed_count(), 2);

        let second = engine.run(&[]).await.unwrap();
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.executed_count(), 0);
        assert_eq!(second.result("notify").unwrap().outcome, Outcome::SkippedUpToDate);
        assert_eq!(fs::read_to_string(dir.path().join("ran.txt")).unwrap(), "ran\n");
    }

    #[test]
    fn test_dry_run_plan() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), ">chr1\nACGT\n").unwrap();
        age(&dir.path().join("genome.fa"), 3600);
        fs::write(dir.path().join("prepared.fa"), ">chr1\nACGT\n").unwrap();
        let config = RunConfig::from_yaml_str("chunks: 2").unwrap();

        let plan = engine(scenario_catalog(), config, dir.path()).plan(&[]).unwrap();
        assert_eq!(plan.nodes.len(), 6);
        assert_eq!(plan.nodes[0].node, "prepare");
        assert_eq!(plan.nodes[0].action, PlannedAction::UpToDate);
        assert_eq!(plan.run_count(), 5);
        assert!(plan.nodes[1].command.script.contains("split/done"));
        // Nothing executed
        assert!(!dir.path().join("split").exists());
    }

    #[tokio::test]
    async fn test_clean_removes_outputs_keeps_inputs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), ">chr1\nACGT\n").unwrap();
        let config = RunConfig::from_yaml_str("chunks: 2").unwrap();
        let engine = engine(scenario_catalog(), config, dir.path());

        engine.run(&[]).await.unwrap();
        let removed = engine.clean().unwrap();

        assert!(!removed.is_empty());
        assert!(dir.path().join("genome.fa").exists());
        assert!(!dir.path().join("final.txt").exists());
        assert!(!dir.path().join("align/1.tsv").exists());
        assert!(!dir.path().join(".daijin").exists());
    }

    #[test]
    fn test_prepare_targets_default_to_terminal_nodes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("genome.fa"), "x").unwrap();
        let config = RunConfig::from_yaml_str("chunks: 2").unwrap();

        let prepared = engine(scenario_catalog(), config, dir.path()).prepare(&[]).unwrap();
        let finalize = prepared.graph.find(&InstanceId::plain("finalize")).unwrap();
        assert_eq!(prepared.targets, HashSet::from([finalize]));
        assert_eq!(prepared.commands.len(), prepared.graph.len());
    }
}
