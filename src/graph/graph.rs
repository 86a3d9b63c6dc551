//! Dependency graph container.
//!
//! A thin arena-style wrapper over `petgraph::DiGraph`: node payloads live in
//! the petgraph arena, adjacency is kept as index pairs, and nodes refer to
//! each other only through indices. The container detects cycles but does not
//! prevent inserting a cyclic edge; rejecting the edge is the caller's
//! contract (the composite builder checks `is_cyclic` before committing).

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Cycle detected in dependency graph")]
    CycleDetected,
}

/// A directed dependency graph over hashable node values.
///
/// Nodes are identified by their value; edges point from prerequisite to
/// dependent (`u -> v` means `v` runs after `u`).
#[derive(Debug, Clone)]
pub struct Graph<T>
where
    T: Clone + Eq + Hash + fmt::Debug,
{
    dag: DiGraph<T, ()>,
    index: HashMap<T, NodeIndex>,
    order: Vec<T>,
}

impl<T> Graph<T>
where
    T: Clone + Eq + Hash + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            dag: DiGraph::new(),
            index: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, node: &T) -> bool {
        self.index.contains_key(node)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.order.iter()
    }

    /// Add a node if not already present; returns its index either way.
    pub fn add_node(&mut self, node: T) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.dag.add_node(node.clone());
        self.index.insert(node.clone(), idx);
        self.order.push(node);
        idx
    }

    /// Add an edge `u -> v`, auto-adding either endpoint that is missing.
    ///
    /// The edge is inserted even if it closes a cycle; callers commit the
    /// graph only after a clean `is_cyclic` check.
    pub fn add_edge(&mut self, u: T, v: T) {
        let ui = self.add_node(u);
        let vi = self.add_node(v);
        if !self.dag.contains_edge(ui, vi) {
            self.dag.add_edge(ui, vi, ());
        }
    }

    /// Whether the graph currently contains a cycle (back-edge DFS).
    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.dag)
    }

    fn index_of(&self, node: &T) -> Result<NodeIndex, GraphError> {
        self.index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(format!("{node:?}")))
    }

    /// Direct successors of `node`.
    pub fn successors(&self, node: &T) -> Result<Vec<&T>, GraphError> {
        let idx = self.index_of(node)?;
        Ok(self
            .dag
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| &self.dag[n])
            .collect())
    }

    /// Direct predecessors of `node`.
    pub fn predecessors(&self, node: &T) -> Result<Vec<&T>, GraphError> {
        let idx = self.index_of(node)?;
        Ok(self
            .dag
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| &self.dag[n])
            .collect())
    }

    /// Longest-path depth of `node`: 1 for a root, else
    /// `1 + max(level of predecessors)`.
    pub fn level(&self, node: &T) -> Result<usize, GraphError> {
        let idx = self.index_of(node)?;
        let mut memo: HashMap<NodeIndex, usize> = HashMap::new();
        self.level_inner(idx, &mut memo, &mut HashSet::new())
    }

    fn level_inner(
        &self,
        idx: NodeIndex,
        memo: &mut HashMap<NodeIndex, usize>,
        visiting: &mut HashSet<NodeIndex>,
    ) -> Result<usize, GraphError> {
        if let Some(&l) = memo.get(&idx) {
            return Ok(l);
        }
        // A node re-entered while still on the walk is a back-edge.
        if !visiting.insert(idx) {
            return Err(GraphError::CycleDetected);
        }
        let mut level = 1;
        for pred in self.dag.neighbors_directed(idx, Direction::Incoming) {
            let pl = self.level_inner(pred, memo, visiting)?;
            level = level.max(pl + 1);
        }
        visiting.remove(&idx);
        memo.insert(idx, level);
        Ok(level)
    }

    /// All nodes whose level equals `level`, in insertion order.
    pub fn nodes_at_level(&self, level: usize) -> Result<Vec<&T>, GraphError> {
        let levels = self.levels()?;
        Ok(self
            .order
            .iter()
            .filter(|n| levels.get(*n) == Some(&level))
            .collect())
    }

    /// Level of every node, computed in one pass.
    pub fn levels(&self) -> Result<HashMap<&T, usize>, GraphError> {
        let mut memo: HashMap<NodeIndex, usize> = HashMap::new();
        let mut out = HashMap::with_capacity(self.order.len());
        for node in &self.order {
            let idx = self.index[node];
            let l = self.level_inner(idx, &mut memo, &mut HashSet::new())?;
            out.insert(node, l);
        }
        Ok(out)
    }

    /// Maximum level over all nodes; 0 for an empty graph.
    pub fn depth(&self) -> Result<usize, GraphError> {
        Ok(self.levels()?.values().copied().max().unwrap_or(0))
    }

    /// Closure of all nodes reachable from `starts` (the starts included).
    pub fn subtree(&self, starts: &[T]) -> Result<Vec<&T>, GraphError> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = Vec::new();
        for s in starts {
            let idx = self.index_of(s)?;
            if seen.insert(idx) {
                stack.push(idx);
            }
        }
        while let Some(idx) = stack.pop() {
            for succ in self.dag.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        Ok(self
            .order
            .iter()
            .filter(|n| seen.contains(&self.index[*n]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn diamond() -> Graph<&'static str> {
        let mut g = Graph::new();
        g.add_edge("A", "B");
        g.add_edge("A", "C");
        g.add_edge("B", "D");
        g.add_edge("C", "D");
        g
    }

    #[test]
    fn test_levels_and_depth() {
        let g = diamond();
        assert_eq!(g.level(&"A").unwrap(), 1);
        assert_eq!(g.level(&"B").unwrap(), 2);
        assert_eq!(g.level(&"C").unwrap(), 2);
        assert_eq!(g.level(&"D").unwrap(), 3);
        assert_eq!(g.depth().unwrap(), 3);
    }

    #[test]
    fn test_nodes_at_level() {
        let g = diamond();
        assert_eq!(g.nodes_at_level(1).unwrap(), vec![&"A"]);
        assert_eq!(g.nodes_at_level(2).unwrap(), vec![&"B", &"C"]);
        assert_eq!(g.nodes_at_level(3).unwrap(), vec![&"D"]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut g = diamond();
        assert!(!g.is_cyclic());
        g.add_edge("D", "A");
        assert!(g.is_cyclic());
    }

    #[test]
    fn test_level_on_cyclic_graph_errors() {
        let mut g = diamond();
        g.add_edge("D", "A");
        assert_eq!(g.level(&"A"), Err(GraphError::CycleDetected));
    }

    #[test]
    fn test_subtree() {
        let g = diamond();
        let sub = g.subtree(&["B"]).unwrap();
        assert_eq!(sub, vec![&"B", &"D"]);
        let all = g.subtree(&["A"]).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_node_not_found() {
        let g = diamond();
        assert!(matches!(g.level(&"Z"), Err(GraphError::NodeNotFound(_))));
    }

    #[test]
    fn test_add_edge_auto_adds_nodes() {
        let mut g: Graph<&str> = Graph::new();
        g.add_edge("X", "Y");
        assert!(g.contains(&"X"));
        assert!(g.contains(&"Y"));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_single_node_graph() {
        let mut g: Graph<&str> = Graph::new();
        g.add_node("only");
        assert_eq!(g.depth().unwrap(), 1);
        assert_eq!(g.nodes_at_level(1).unwrap(), vec![&"only"]);
    }

    #[test]
    fn test_empty_graph_depth() {
        let g: Graph<&str> = Graph::new();
        assert_eq!(g.depth().unwrap(), 0);
    }
}
