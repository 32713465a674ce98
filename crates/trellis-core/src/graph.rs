//! Shared dependency-graph utility.
//!
//! One graph implementation serves both execution paths: the canvas compiler
//! uses [`DependencyGraph::toposort`] for its explicit pre-pass sort, and the
//! scheduler uses [`DependencyGraph::demand_order`] for its demand-driven
//! depth-first walk. Cycle detection lives here and nowhere else.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use trellis_types::error::EngineError;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// A directed dependency graph over string ids.
///
/// An edge `from -> to` means `to` depends on `from` (`from` must execute
/// first).
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build a graph containing the given node ids and no edges.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in ids {
            let id = id.into();
            let node = graph.add_node(id.clone());
            index.insert(id, node);
        }
        Self { graph, index }
    }

    /// Whether the graph contains the given node.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Add a dependency edge: `to` depends on `from`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), EngineError> {
        let from_idx = self
            .index
            .get(from)
            .ok_or_else(|| EngineError::UnknownReference(format!("'{to}' references unknown id '{from}'")))?;
        let to_idx = self
            .index
            .get(to)
            .ok_or_else(|| EngineError::UnknownReference(format!("unknown id '{to}'")))?;
        self.graph.add_edge(*from_idx, *to_idx, ());
        Ok(())
    }

    /// Direct dependencies of a node, in edge insertion order.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        let Some(idx) = self.index.get(id) else {
            return Vec::new();
        };
        // petgraph iterates neighbors in reverse insertion order.
        let mut deps: Vec<&str> = self
            .graph
            .neighbors_directed(*idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].as_str())
            .collect();
        deps.reverse();
        deps
    }

    /// Topological order of every node.
    ///
    /// A cycle aborts the sort with [`EngineError::CircularDependency`]
    /// naming a node on the cycle; no partial order is returned.
    pub fn toposort(&self) -> Result<Vec<String>, EngineError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            EngineError::CircularDependency {
                id: self.graph[cycle.node_id()].clone(),
            }
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Demand-driven execution order.
    ///
    /// Visits ids in the given encounter order; each visit first recursively
    /// resolves the node's dependencies. An explicit `visiting` set, distinct
    /// from `done`, turns re-encountering an in-progress node into
    /// [`EngineError::CircularDependency`]. Two graphs with the same edges
    /// produce the same relative order for the same encounter order.
    pub fn demand_order(&self, encounter_order: &[&str]) -> Result<Vec<String>, EngineError> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();
        let mut order: Vec<String> = Vec::new();

        for id in encounter_order {
            self.visit(id, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        if done.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(EngineError::CircularDependency { id: id.to_string() });
        }
        for dep in self.dependencies_of(id) {
            self.visit(dep, visiting, done, order)?;
        }
        visiting.remove(id);
        done.insert(id);
        order.push(id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
