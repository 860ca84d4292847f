//! Dependency graph resolution.
//!
//! Formulae and their dependency edges form a directed acyclic graph. This
//! module builds that graph from a [`FormulaRegistry`], rejects unknown
//! dependencies and cycles, and produces a deterministic build order: every
//! formula comes after all of its dependencies, and formulae that become ready
//! at the same time are ordered by name.
//!
//! Edges point from a dependency to its dependent, so a formula's
//! dependencies are its incoming neighbours.

use crate::error::ConfigError;
use crate::formula::{DependencyEdge, DependencyKind};
use crate::registry::FormulaRegistry;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, DependencyKind>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Graph of every formula in the registry.
    pub fn from_registry(registry: &FormulaRegistry) -> Result<Self, ConfigError> {
        let names = registry.names().map(str::to_string).collect();
        Self::build(registry, &names)
    }

    /// Graph of the requested formulae and everything they transitively depend on.
    pub fn for_targets<S: AsRef<str>>(
        registry: &FormulaRegistry,
        targets: &[S],
    ) -> Result<Self, ConfigError> {
        let mut closure = BTreeSet::new();
        let mut stack = Vec::new();

        for target in targets {
            let formula = registry.lookup(target.as_ref())?;
            stack.push(formula.name.clone());
        }

        while let Some(name) = stack.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let formula = registry.lookup(&name)?;
            for (dep, _) in formula.dependencies() {
                if closure.contains(&dep) || registry.is_provided(&dep) {
                    continue;
                }
                if registry.get(&dep).is_none() {
                    return Err(ConfigError::MissingDependency {
                        formula: name.clone(),
                        dependency: dep,
                    });
                }
                stack.push(dep);
            }
        }

        Self::build(registry, &closure)
    }

    fn build(registry: &FormulaRegistry, names: &BTreeSet<String>) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();

        for name in names {
            nodes.insert(name.clone(), graph.add_node(name.clone()));
        }

        for name in names {
            let formula = registry.lookup(name)?;
            let dependent = nodes[name];
            for (dep, kind) in formula.dependencies() {
                match nodes.get(&dep) {
                    Some(&dependency) => {
                        graph.add_edge(dependency, dependent, kind);
                    }
                    None if registry.is_provided(&dep) => {
                        debug!(formula = %name, dependency = %dep, "dependency provided by host");
                    }
                    None => {
                        return Err(ConfigError::MissingDependency {
                            formula: name.clone(),
                            dependency: dep,
                        });
                    }
                }
            }
        }

        let dag = Self { graph, nodes };
        if let Some(members) = dag.find_cycle() {
            return Err(ConfigError::Cycle { members });
        }
        Ok(dag)
    }

    /// Every formula before its dependents, ties broken by name.
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.dependency_count(idx)))
            .collect();

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| self.graph[*idx].as_str())
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            let idx = self.nodes[name];
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(self.graph[dependent].as_str());
                    }
                }
            }
        }

        order
    }

    /// Number of distinct dependencies of a node (parallel edges collapse).
    fn dependency_count(&self, idx: NodeIndex) -> usize {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// A cycle as a dependency path starting at its smallest member, or `None`.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
            })
            .map(|scc| self.cycle_path(&scc))
            .collect();
        cycles.sort();
        cycles.into_iter().next()
    }

    /// Walk "depends on" edges inside one strongly connected component until
    /// returning to the start.
    fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<String> {
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc
            .iter()
            .copied()
            .min_by(|a, b| self.graph[*a].cmp(&self.graph[*b]))
            .unwrap_or(scc[0]);

        let mut path = vec![start];
        let mut visited = BTreeSet::from([start]);
        while let Some(&current) = path.last() {
            let mut next_steps: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| members.contains(n))
                .collect();
            next_steps.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            if next_steps.contains(&start) {
                break;
            }
            match next_steps.into_iter().find(|n| !visited.contains(n)) {
                Some(next) => {
                    visited.insert(next);
                    path.push(next);
                }
                None => {
                    path.pop();
                }
            }
        }

        if path.is_empty() {
            path.push(start);
        }
        path.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `name`, sorted.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.neighbours(name, Direction::Incoming)
    }

    /// Formulae that directly depend on `name`, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.neighbours(name, Direction::Outgoing)
    }

    fn neighbours(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let names: BTreeSet<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        names.into_iter().collect()
    }

    /// Everything downstream of `name`, excluding `name` itself.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.nodes.get(name) else {
            return seen;
        };

        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(self.graph[dependent].clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (dependency, dependent) = self.graph.edge_endpoints(e)?;
                Some(DependencyEdge {
                    formula: self.graph[dependent].clone(),
                    depends_on: self.graph[dependency].clone(),
                    kind: self.graph[e],
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.formula, &a.depends_on).cmp(&(&b.formula, &b.depends_on)));
        edges
    }

    /// Kind of the edge `formula -> depends_on`, if any.
    pub fn edge_kind(&self, formula: &str, depends_on: &str) -> Option<DependencyKind> {
        let from = *self.nodes.get(depends_on)?;
        let to = *self.nodes.get(formula)?;
        let edge = self.graph.find_edge(from, to)?;
        Some(self.graph[edge])
    }
}

/// Ordered set of formulae one run has to consider.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Dependencies before dependents.
    pub order: Vec<String>,
    /// Formulae named on the command line.
    pub requested: BTreeSet<String>,
    graph: DependencyGraph,
}

impl BuildPlan {
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn is_requested(&self, name: &str) -> bool {
        self.requested.contains(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Resolve the requested formulae into a build plan.
pub fn resolve<S: AsRef<str>>(
    registry: &FormulaRegistry,
    targets: &[S],
) -> Result<BuildPlan, ConfigError> {
    let graph = DependencyGraph::for_targets(registry, targets)?;
    let order = graph.topological_order();

    let requested = targets
        .iter()
        .filter_map(|t| registry.get(t.as_ref()).map(|f| f.name.clone()))
        .collect();

    debug!(formulae = order.len(), order = ?order, "resolved build order");

    Ok(BuildPlan {
        order,
        requested,
        graph,
    })
}
