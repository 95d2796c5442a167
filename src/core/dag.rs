//! Phase dependency graph.
//!
//! This module provides the PhaseGraph structure that represents phase
//! dependencies as a directed graph and derives execution levels from it:
//! sets of phases whose dependencies are all satisfied by earlier levels
//! and which may therefore run concurrently.

use crate::core::phase::{PhaseNode, ValidationIssue, ValidationReport};
use crate::error::{Error, Result};
use crate::{klog_debug, klog_warn};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// The phase dependency graph.
///
/// Nodes are phases; an edge `a -> b` means `b` depends on `a`.
/// Dependencies naming unknown phases cannot become edges and are kept
/// aside: they still count toward in-degree, so such a phase is never
/// schedulable.
pub struct PhaseGraph {
    /// The underlying directed graph.
    graph: DiGraph<PhaseNode, ()>,
    /// Index mapping from phase id to NodeIndex for fast lookups.
    phase_index: HashMap<String, NodeIndex>,
    /// `(phase, dependency)` pairs whose dependency is not in the set.
    dangling: Vec<(String, String)>,
}

impl PhaseGraph {
    /// Index phases by id and wire their dependency edges.
    ///
    /// Duplicate ids are not rejected here: the later declaration replaces
    /// the earlier one in place. Use [`PhaseGraph::validate`] to surface them.
    pub fn build(phases: &[PhaseNode]) -> Self {
        let mut graph = DiGraph::new();
        let mut phase_index: HashMap<String, NodeIndex> = HashMap::new();

        for phase in phases {
            if let Some(&index) = phase_index.get(&phase.id) {
                klog_warn!("Duplicate phase id '{}', later declaration wins", phase.id);
                graph[index] = phase.clone();
            } else {
                let index = graph.add_node(phase.clone());
                phase_index.insert(phase.id.clone(), index);
            }
        }

        let mut dangling = Vec::new();
        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for index in indices {
            let dependencies = graph[index].dependencies.clone();
            for dependency in dependencies {
                match phase_index.get(&dependency) {
                    Some(&dep_index) => {
                        graph.update_edge(dep_index, index, ());
                    }
                    None => dangling.push((graph[index].id.clone(), dependency)),
                }
            }
        }

        Self {
            graph,
            phase_index,
            dangling,
        }
    }

    /// Get a phase by id.
    pub fn get_phase(&self, id: &str) -> Option<&PhaseNode> {
        self.phase_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Check if the graph contains a phase.
    pub fn contains_phase(&self, id: &str) -> bool {
        self.phase_index.contains_key(id)
    }

    /// Number of distinct phases.
    pub fn phase_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of resolved dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Phases that directly depend on the given phase.
    pub fn dependents(&self, id: &str) -> Vec<&PhaseNode> {
        match self.phase_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All phases in declaration order.
    pub fn phases(&self) -> impl Iterator<Item = &PhaseNode> {
        self.graph.node_weights()
    }

    /// Group phases into execution levels using Kahn's algorithm.
    ///
    /// Each round drains exactly the phases whose in-degree is zero at the
    /// start of that round; phases freed by the round form the next level.
    /// Within a level phases keep declaration order.
    ///
    /// # Errors
    /// Returns [`Error::Cycle`] naming every phase that never reached
    /// in-degree zero. No partial plan is returned.
    pub fn topological_sort(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();
        for (phase, _) in &self.dangling {
            if let Some(&index) = self.phase_index.get(phase) {
                in_degree[index.index()] += 1;
            }
        }

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    let degree = &mut in_degree[dependent.index()];
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort();
            placed += current.len();
            levels.push(
                current
                    .iter()
                    .map(|&index| self.graph[index].id.clone())
                    .collect(),
            );
            current = next;
        }

        if placed < self.graph.node_count() {
            let unresolved: Vec<String> = self
                .graph
                .node_indices()
                .filter(|index| in_degree[index.index()] > 0)
                .map(|index| self.graph[index].id.clone())
                .collect();
            klog_debug!("Topological sort failed, unresolved: {:?}", unresolved);
            return Err(Error::Cycle { phases: unresolved });
        }

        Ok(levels)
    }

    /// Check a phase set for dangling references, self-dependencies, cycles
    /// and duplicate ids, in that order. Never fails; problems are returned
    /// as issues.
    pub fn validate(phases: &[PhaseNode]) -> ValidationReport {
        let ids: HashSet<&str> = phases.iter().map(|p| p.id.as_str()).collect();
        let mut issues = Vec::new();

        for phase in phases {
            for dependency in &phase.dependencies {
                if !ids.contains(dependency.as_str()) {
                    issues.push(ValidationIssue::MissingDependency {
                        phase: phase.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for phase in phases {
            if phase.dependencies.iter().any(|d| d == &phase.id) {
                issues.push(ValidationIssue::SelfDependency {
                    phase: phase.id.clone(),
                });
            }
        }

        // Dangling and self edges are already reported; sort what remains so
        // the cycle issue names only phases caught in multi-phase cycles.
        let sanitized: Vec<PhaseNode> = phases
            .iter()
            .map(|phase| PhaseNode {
                dependencies: phase
                    .dependencies
                    .iter()
                    .filter(|d| *d != &phase.id && ids.contains(d.as_str()))
                    .cloned()
                    .collect(),
                ..phase.clone()
            })
            .collect();
        if let Err(Error::Cycle { phases: stuck }) = Self::build(&sanitized).topological_sort() {
            issues.push(ValidationIssue::Cycle { phases: stuck });
        }

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for phase in phases {
            if !seen.insert(phase.id.as_str()) && reported.insert(phase.id.as_str()) {
                issues.push(ValidationIssue::DuplicatePhase {
                    phase: phase.id.clone(),
                });
            }
        }

        ValidationReport::from_issues(issues)
    }

    /// Longest dependency chain, from its root to its deepest phase.
    ///
    /// Depth is 0 for a phase without dependencies, otherwise one more than
    /// its deepest dependency. The path ends at the first phase (declaration
    /// order) of maximal depth and walks back through the deepest dependency
    /// at each step. Ties pick the dependency listed first; the choice is
    /// arbitrary and carries no meaning.
    pub fn critical_path(&self) -> Vec<String> {
        let mut memo: HashMap<NodeIndex, usize> = HashMap::new();
        let mut visiting: HashSet<NodeIndex> = HashSet::new();

        let mut end: Option<(NodeIndex, usize)> = None;
        for index in self.graph.node_indices() {
            let depth = self.depth_of(index, &mut memo, &mut visiting);
            if end.map_or(true, |(_, best)| depth > best) {
                end = Some((index, depth));
            }
        }

        let Some((mut current, _)) = end else {
            return Vec::new();
        };

        let mut path = vec![current];
        while path.len() <= self.graph.node_count() {
            let mut deepest: Option<(NodeIndex, usize)> = None;
            for dep in self.dependency_indices(current) {
                let depth = memo.get(&dep).copied().unwrap_or(0);
                if deepest.map_or(true, |(_, best)| depth > best) {
                    deepest = Some((dep, depth));
                }
            }
            match deepest {
                Some((dep, _)) => {
                    path.push(dep);
                    current = dep;
                }
                None => break,
            }
        }

        path.reverse();
        path.into_iter()
            .map(|index| self.graph[index].id.clone())
            .collect()
    }

    /// Best-case duration: every level takes `avg_phase_duration` and all
    /// phases in a level run fully in parallel.
    pub fn estimate_duration(&self, avg_phase_duration: Duration) -> Result<Duration> {
        let levels = self.topological_sort()?;
        let count = u32::try_from(levels.len()).unwrap_or(u32::MAX);
        Ok(avg_phase_duration.saturating_mul(count))
    }

    /// Resolved dependencies of a phase in declaration order, excluding itself.
    fn dependency_indices(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph[index]
            .dependencies
            .iter()
            .filter_map(|dep| self.phase_index.get(dep).copied())
            .filter(|&dep| dep != index)
            .collect()
    }

    fn depth_of(
        &self,
        index: NodeIndex,
        memo: &mut HashMap<NodeIndex, usize>,
        visiting: &mut HashSet<NodeIndex>,
    ) -> usize {
        if let Some(&depth) = memo.get(&index) {
            return depth;
        }
        // Back edge: stop instead of recursing forever.
        if !visiting.insert(index) {
            return 0;
        }
        let depth = self
            .dependency_indices(index)
            .into_iter()
            .map(|dep| 1 + self.depth_of(dep, memo, visiting))
            .max()
            .unwrap_or(0);
        visiting.remove(&index);
        memo.insert(index, depth);
        depth
    }
}

impl std::fmt::Debug for PhaseGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseGraph")
            .field("phases", &self.phase_count())
            .field("dependencies", &self.dependency_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
