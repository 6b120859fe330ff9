//! Dependency Graph
//!
//! Builds the execution DAG from concrete step instances. Edges are never
//! declared: node A precedes node B iff some output path of A is an input
//! path of B. Paths are the sole identity for dependency purposes.
//!
//! Construction:
//! 1. Resolve every path against the run working directory
//! 2. Map each output path to its single producer (duplicates are fatal)
//! 3. Link inputs to producers; unproduced inputs become external inputs
//! 4. Detect cycles (depth-first, reporting the offending node sequence)
//! 5. Compute a topological order (Kahn's algorithm)
//!
//! The structure is immutable once built. Only node status changes, and only
//! along the transitions [`NodeStatus::can_transition_to`] allows.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{EngineError, Result};

use super::wildcards::{InstanceId, StepInstance};

/// Index of a node inside a [`Graph`].
pub type NodeIndex = usize;

/// Why a node was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Outputs already exist and are fresh.
    UpToDate,
    /// A predecessor failed.
    Unreachable,
}

/// Lifecycle status of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Skipped(SkipReason),
    Failed,
}

impl NodeStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped(_) | Self::Failed)
    }

    /// Allowed moves: Pending→Ready→Running→{Done, Failed}, Pending→Skipped.
    pub fn can_transition_to(&self, to: NodeStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Ready)
                | (Self::Pending, Self::Skipped(_))
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Skipped(SkipReason::UpToDate) => write!(f, "skipped (up to date)"),
            Self::Skipped(SkipReason::Unreachable) => write!(f, "skipped (unreachable)"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A role with absolute paths.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRole {
    pub name: String,
    pub paths: Vec<PathBuf>,
}

/// A step instance placed in the graph with fully resolved paths.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub instance: StepInstance,
    pub inputs: Vec<NodeRole>,
    pub outputs: Vec<NodeRole>,
    pub log_path: PathBuf,
    pub working_dir: PathBuf,
    pub threads: usize,
    status: NodeStatus,
}

impl GraphNode {
    fn from_instance(instance: StepInstance, workdir: &Path) -> Self {
        let resolve_roles = |roles: &[super::wildcards::ResolvedRole]| {
            roles
                .iter()
                .map(|role| NodeRole {
                    name: role.name.clone(),
                    paths: role.paths.iter().map(|p| resolve_path(workdir, p)).collect(),
                })
                .collect::<Vec<_>>()
        };

        let inputs = resolve_roles(&instance.inputs);
        let outputs = resolve_roles(&instance.outputs);
        let log_path = resolve_path(workdir, &instance.log);
        let working_dir = match &instance.workdir {
            Some(dir) => resolve_path(workdir, dir),
            None => normalize_path(workdir),
        };

        Self {
            threads: instance.threads,
            inputs,
            outputs,
            log_path,
            working_dir,
            instance,
            status: NodeStatus::Pending,
        }
    }

    /// The node's identity.
    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }

    /// Current status.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Whether a failure of this node may be tolerated.
    pub fn is_best_effort(&self) -> bool {
        self.instance.best_effort
    }

    /// All input paths in role order.
    pub fn input_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter().flat_map(|r| r.paths.iter())
    }

    /// All output paths in role order.
    pub fn output_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.outputs.iter().flat_map(|r| r.paths.iter())
    }
}

/// Immutable dependency DAG over graph nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    predecessors: Vec<Vec<NodeIndex>>,
    successors: Vec<Vec<NodeIndex>>,
    producers: HashMap<PathBuf, NodeIndex>,
    external_inputs: BTreeSet<PathBuf>,
    order: Vec<NodeIndex>,
    workdir: PathBuf,
}

impl Graph {
    /// Builds the DAG from concrete instances.
    ///
    /// Relative paths are resolved against `workdir`.
    pub fn build(instances: Vec<StepInstance>, workdir: &Path) -> Result<Self> {
        info!("Building dependency graph from {} instances", instances.len());

        let mut seen_ids = HashSet::new();
        for instance in &instances {
            if !seen_ids.insert(instance.id.clone()) {
                return Err(EngineError::Catalog(format!(
                    "step instance '{}' is defined more than once",
                    instance.id
                )));
            }
        }

        let nodes: Vec<GraphNode> = instances
            .into_iter()
            .map(|instance| GraphNode::from_instance(instance, workdir))
            .collect();

        // Output path -> producer
        let mut producers: HashMap<PathBuf, NodeIndex> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            for path in node.output_paths() {
                if let Some(&first) = producers.get(path) {
                    return Err(EngineError::DuplicateProducer {
                        path: path.clone(),
                        first: nodes[first].id().to_string(),
                        second: node.id().to_string(),
                    });
                }
                producers.insert(path.clone(), idx);
            }
        }

        // Derive edges from path coincidences
        let mut predecessors: Vec<BTreeSet<NodeIndex>> = vec![BTreeSet::new(); nodes.len()];
        let mut successors: Vec<BTreeSet<NodeIndex>> = vec![BTreeSet::new(); nodes.len()];
        let mut external_inputs = BTreeSet::new();

        for (idx, node) in nodes.iter().enumerate() {
            for path in node.input_paths() {
                match producers.get(path) {
                    Some(&producer) => {
                        predecessors[idx].insert(producer);
                        successors[producer].insert(idx);
                    }
                    None => {
                        external_inputs.insert(path.clone());
                    }
                }
            }
        }

        let mut graph = Self {
            nodes,
            predecessors: predecessors.into_iter().map(|s| s.into_iter().collect()).collect(),
            successors: successors.into_iter().map(|s| s.into_iter().collect()).collect(),
            producers,
            external_inputs,
            order: Vec::new(),
            workdir: normalize_path(workdir),
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(EngineError::CyclicDependency { cycle });
        }
        graph.order = graph.topological_sort()?;

        info!(
            "Graph built: {} nodes, {} edges, {} external inputs",
            graph.len(),
            graph.edge_count(),
            graph.external_inputs.len()
        );
        debug!(
            "Topological order: {:?}",
            graph.order.iter().map(|&i| graph.nodes[i].id().to_string()).collect::<Vec<_>>()
        );

        Ok(graph)
    }

    /// Depth-first search for a cycle; returns the node sequence closing it.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Finished,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // Explicit stack of (node, next successor position)
            let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(&(node, pos)) = stack.last() {
                if let Some(&next) = self.successors[node].get(pos) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::OnStack;
                            stack.push((next, 0));
                        }
                        Mark::OnStack => {
                            let start = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].id().to_string())
                                .collect();
                            cycle.push(self.nodes[next].id().to_string());
                            return Some(cycle);
                        }
                        Mark::Finished => {}
                    }
                } else {
                    marks[node] = Mark::Finished;
                    stack.pop();
                }
            }
        }

        None
    }

    /// Kahn's algorithm; dependencies come before dependents.
    fn topological_sort(&self) -> Result<Vec<NodeIndex>> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut queue: VecDeque<NodeIndex> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(current) = queue.pop_front() {
            sorted.push(current);
            for &next in &self.successors[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].id().to_string())
                .collect();
            return Err(EngineError::CyclicDependency { cycle: stuck });
        }

        Ok(sorted)
    }

    /// Returns a graph holding only the nodes needed for `targets` and
    /// their transitive predecessors.
    ///
    /// A target is either an output path (absolute, or relative to the
    /// working directory), a node id such as `align[chunk=002]`, or a step
    /// name selecting all of its instances.
    pub fn restrict_to(&self, targets: &[String]) -> Result<Graph> {
        if targets.is_empty() {
            return Ok(self.clone());
        }

        let mut wanted = Vec::new();
        for target in targets {
            let matches = self.resolve_target(target);
            if matches.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "target '{}' is neither a produced output nor a step in the graph",
                    target
                )));
            }
            wanted.extend(matches);
        }

        let keep = self.with_ancestors(&wanted);
        info!(
            "Restricting graph to {} target(s): {} of {} nodes needed",
            targets.len(),
            keep.len(),
            self.len()
        );

        let instances = self
            .order
            .iter()
            .filter(|&&i| keep.contains(&i))
            .map(|&i| self.nodes[i].instance.clone())
            .collect();
        Graph::build(instances, &self.workdir)
    }

    /// Nodes selected by a target string (output path, node id or step name).
    pub fn resolve_target(&self, target: &str) -> Vec<NodeIndex> {
        let path = resolve_path(&self.workdir, target);
        if let Some(producer) = self.producer_of(&path) {
            return vec![producer];
        }

        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.id().to_string() == target || n.id().step == target)
            .map(|(i, _)| i)
            .collect()
    }

    fn with_ancestors(&self, start: &[NodeIndex]) -> HashSet<NodeIndex> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = start.to_vec();
        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(self.predecessors[idx].iter().copied());
            }
        }
        seen
    }

    /// Fails with the full list of external inputs that do not exist on disk.
    pub fn check_external_inputs(&self) -> Result<()> {
        let missing: Vec<PathBuf> = self
            .external_inputs
            .iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect();

        if missing.is_empty() {
            debug!("All {} external inputs present", self.external_inputs.len());
            Ok(())
        } else {
            Err(EngineError::MissingExternalInput { paths: missing })
        }
    }

    /// Caps every node's thread allocation at the global budget.
    pub fn clamp_threads(&mut self, max_threads: usize) {
        let max_threads = max_threads.max(1);
        for node in &mut self.nodes {
            if node.threads > max_threads {
                warn!(
                    "Node '{}' requests {} threads; capping at budget of {}",
                    node.id(),
                    node.threads,
                    max_threads
                );
                node.threads = max_threads;
            }
        }
    }

    /// Moves a node to a new status, enforcing the lifecycle.
    pub(crate) fn transition(&mut self, idx: NodeIndex, to: NodeStatus) -> Result<()> {
        let node = &mut self.nodes[idx];
        if !node.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                node: node.id().to_string(),
                from: node.status.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Node '{}': {} -> {}", node.id(), node.status, to);
        node.status = to;
        Ok(())
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn status(&self, idx: NodeIndex) -> NodeStatus {
        self.nodes[idx].status
    }

    /// Finds a node by identity.
    pub fn find(&self, id: &InstanceId) -> Option<NodeIndex> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    pub fn predecessors(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.predecessors[idx]
    }

    pub fn successors(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.successors[idx]
    }

    /// All edges as (producer, consumer) pairs.
    pub fn edges(&self) -> Vec<(NodeIndex, NodeIndex)> {
        self.successors
            .iter()
            .enumerate()
            .flat_map(|(from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Paths the environment must provide.
    pub fn external_inputs(&self) -> &BTreeSet<PathBuf> {
        &self.external_inputs
    }

    /// The node producing a path, if any.
    pub fn producer_of(&self, path: &Path) -> Option<NodeIndex> {
        self.producers.get(&normalize_path(path)).copied()
    }

    /// Nodes nothing else depends on.
    pub fn terminal_nodes(&self) -> Vec<NodeIndex> {
        (0..self.nodes.len())
            .filter(|&i| self.successors[i].is_empty())
            .collect()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

/// Resolves a path expression against the working directory.
pub fn resolve_path(workdir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&workdir.join(path))
    }
}

/// Lexically removes `.` and resolves `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
