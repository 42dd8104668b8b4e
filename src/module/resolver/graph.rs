//! Module dependency graph
//!
//! Handles cycle detection and deterministic load ordering for a set of
//! modules. Only dependencies that order loading (everything except
//! `Conflicting`), apply to the host, and name a module inside the set become
//! edges; required targets outside the set are reported as missing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

use super::dependency::{DependencyKind, DependencySpec, HostTarget};
use crate::module::error::DependencyError;

/// One module and its declared dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub name: String,
    pub dependencies: Vec<DependencySpec>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, dependencies: Vec<DependencySpec>) -> Self {
        Self {
            name: name.into(),
            dependencies,
        }
    }
}

/// Dependency resolution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyResolution {
    /// Modules in load order (dependencies first)
    pub load_order: Vec<String>,
    /// Required dependencies not present in the module set, as (module, dependency)
    pub missing: Vec<(String, String)>,
}

/// Acyclic dependency graph over a module set
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `edges[i]` lists the nodes node `i` depends on
    edges: Vec<Vec<usize>>,
    missing: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Build the graph and reject cycles.
    ///
    /// Node order is the input order; duplicate names keep their first
    /// occurrence.
    pub fn build(nodes: &[GraphNode], host: &HostTarget) -> Result<Self, DependencyError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut kept: Vec<&GraphNode> = Vec::new();
        for node in nodes {
            if index.contains_key(node.name.as_str()) {
                debug!("Ignoring duplicate graph node {}", node.name);
                continue;
            }
            index.insert(node.name.as_str(), kept.len());
            kept.push(node);
        }

        let mut edges = vec![Vec::new(); kept.len()];
        let mut missing = Vec::new();
        for (i, node) in kept.iter().enumerate() {
            for dep in &node.dependencies {
                if !dep.kind.orders_load() || !dep.applies_to(host) {
                    continue;
                }
                match index.get(dep.target.as_str()) {
                    Some(&j) => {
                        if !edges[i].contains(&j) {
                            edges[i].push(j);
                        }
                    }
                    None if dep.kind == DependencyKind::Required => {
                        missing.push((node.name.clone(), dep.target.clone()));
                    }
                    None => {}
                }
            }
        }

        let graph = DependencyGraph {
            names: kept.iter().map(|n| n.name.clone()).collect(),
            edges,
            missing,
        };
        graph.detect_cycle()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn missing(&self) -> &[(String, String)] {
        &self.missing
    }

    /// Direct in-set dependencies of `name`
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.edges[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Depth-first search with an on-stack marker set, visiting roots in input order
    fn detect_cycle(&self) -> Result<(), DependencyError> {
        let mut done = vec![false; self.names.len()];
        let mut on_stack = vec![false; self.names.len()];
        let mut stack: Vec<usize> = Vec::new();

        for root in 0..self.names.len() {
            if !done[root] {
                self.visit(root, &mut done, &mut on_stack, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        done: &mut [bool],
        on_stack: &mut [bool],
        stack: &mut Vec<usize>,
    ) -> Result<(), DependencyError> {
        on_stack[node] = true;
        stack.push(node);

        for &dep in &self.edges[node] {
            if on_stack[dep] {
                let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let members: Vec<String> = stack[start..]
                    .iter()
                    .map(|&n| self.names[n].clone())
                    .collect();
                debug!("Circular dependency detected: {:?}", members);
                return Err(DependencyError::Circular { members });
            }
            if !done[dep] {
                self.visit(dep, done, on_stack, stack)?;
            }
        }

        stack.pop();
        on_stack[node] = false;
        done[node] = true;
        Ok(())
    }

    /// Stable Kahn's algorithm: dependencies first, ties broken by input order
    pub fn topo_order(&self) -> Vec<String> {
        let n = self.names.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.edges.iter().enumerate() {
            in_degree[i] = deps.len();
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.names[i].clone());
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        debug!("Load order: {:?}", order);
        order
    }
}

/// Build the graph for `nodes` and return its load order
pub fn resolve_load_order(
    nodes: &[GraphNode],
    host: &HostTarget,
) -> Result<DependencyResolution, DependencyError> {
    let graph = DependencyGraph::build(nodes, host)?;
    Ok(DependencyResolution {
        load_order: graph.topo_order(),
        missing: graph.missing.clone(),
    })
}

/// Names reachable from `roots` through `lookup`, roots first then in discovery order
pub fn dependency_closure<F>(roots: &[String], mut lookup: F) -> Vec<GraphNode>
where
    F: FnMut(&str) -> Option<Vec<DependencySpec>>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: Vec<String> = Vec::new();
    for root in roots {
        if seen.insert(root.clone()) {
            queue.push(root.clone());
        }
    }

    let mut nodes = Vec::new();
    let mut cursor = 0;
    while cursor < queue.len() {
        let name = queue[cursor].clone();
        cursor += 1;
        let deps = lookup(&name).unwrap_or_default();
        for dep in &deps {
            if dep.kind.orders_load() && seen.insert(dep.target.clone()) {
                queue.push(dep.target.clone());
            }
        }
        nodes.push(GraphNode::new(name, deps));
    }
    nodes
}
