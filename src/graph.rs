// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A mutable DAG of work nodes with status transitions.
//!
//! Nodes advance monotonically `ready -> running -> finished`; the single
//! sanctioned exception is `running -> ready`, used when thread-affinity
//! enforcement makes a worker yield before finishing. Edges point from a
//! dependent node to its prerequisite, cycles are rejected as edges are
//! inserted, and free-node discovery is an ordered scan of the node table.
//!
//! The graph itself is not synchronised; the orchestrator owns one and
//! mutates it under its own lock.

use crate::errors::GraphError;
use indexmap::{IndexMap, IndexSet};
use std::{collections::HashMap, fmt, hash::Hash};

/// The scheduling state of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// The node has not started yet.
    Ready,

    /// The node has been handed to a worker.
    Running,

    /// The node's work is done.
    Finished,
}

impl NodeStatus {
    fn name(self) -> &'static str {
        match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A dynamic dependency graph over nodes of type `T`.
///
/// `T` is the node identity: cloning must be cheap (the runners use
/// `Arc<TestMethod>`) and equality/hashing must be stable for the lifetime
/// of the graph.
#[derive(Clone, Debug)]
pub struct DynamicGraph<T> {
    nodes: IndexMap<T, NodeStatus>,
    dependencies: HashMap<T, IndexSet<T>>,
    dependents: HashMap<T, IndexSet<T>>,
}

impl<T> Default for DynamicGraph<T>
where
    T: Clone + Eq + Hash + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynamicGraph<T>
where
    T: Clone + Eq + Hash + fmt::Display,
{
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
        }
    }

    /// Adds a node in the `ready` state.
    pub fn add_node(&mut self, node: T) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node) {
            return Err(GraphError::DuplicateNode {
                node: node.to_string(),
            });
        }
        self.nodes.insert(node, NodeStatus::Ready);
        Ok(())
    }

    /// Adds an edge: `from` must not start until `to` is finished.
    ///
    /// Both nodes must already be present, and the edge is rejected if it
    /// would close a cycle.
    pub fn add_edge(&mut self, from: &T, to: &T) -> Result<(), GraphError> {
        for node in [from, to] {
            if !self.nodes.contains_key(node) {
                return Err(GraphError::UnknownNode {
                    node: node.to_string(),
                });
            }
        }
        if from == to || self.depends_transitively(to, from) {
            return Err(GraphError::EdgeWouldCycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.dependencies
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.dependents
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        Ok(())
    }

    // True if `node` transitively depends on `target`.
    fn depends_transitively(&self, node: &T, target: &T) -> bool {
        let mut stack = vec![node.clone()];
        let mut visited = IndexSet::new();
        while let Some(current) = stack.pop() {
            if &current == target {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(&current) {
                stack.extend(deps.iter().cloned());
            }
        }
        false
    }

    /// Transitions a node to a new status, validating monotonicity.
    ///
    /// `running -> ready` is allowed; it is reserved for workers that yield
    /// under thread-affinity enforcement.
    pub fn set_status(&mut self, node: &T, status: NodeStatus) -> Result<(), GraphError> {
        let current = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| GraphError::UnknownNode {
                node: node.to_string(),
            })?;
        let allowed = matches!(
            (*current, status),
            (NodeStatus::Ready, NodeStatus::Running)
                | (NodeStatus::Running, NodeStatus::Finished)
                | (NodeStatus::Running, NodeStatus::Ready)
        );
        if !allowed {
            return Err(GraphError::InvalidTransition {
                node: node.to_string(),
                from: current.name(),
                to: status.name(),
            });
        }
        *current = status;
        Ok(())
    }

    /// The status of a node, if present.
    pub fn status(&self, node: &T) -> Option<NodeStatus> {
        self.nodes.get(node).copied()
    }

    /// The nodes that are `ready` with every dependency `finished`, in
    /// insertion order.
    pub fn free_nodes(&self) -> Vec<T> {
        self.nodes
            .iter()
            .filter(|(node, status)| {
                **status == NodeStatus::Ready
                    && self.dependencies.get(*node).map_or(true, |deps| {
                        deps.iter()
                            .all(|dep| self.nodes.get(dep) == Some(&NodeStatus::Finished))
                    })
            })
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// The immediate prerequisites of a node.
    pub fn dependencies_of(&self, node: &T) -> Vec<T> {
        self.dependencies
            .get(node)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The nodes that depend on `node`.
    pub fn successors_of(&self, node: &T) -> Vec<T> {
        self.dependents
            .get(node)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The number of nodes with the given status.
    pub fn node_count_with_status(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|s| **s == status).count()
    }

    /// True once every node is finished.
    pub fn is_drained(&self) -> bool {
        self.node_count_with_status(NodeStatus::Finished) == self.nodes.len()
    }

    /// Renders the graph in DOT syntax, annotating each node with its
    /// status.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (node, status) in &self.nodes {
            out.push_str(&format!("  \"{node}\" [label=\"{node}\\n{status}\"];\n"));
        }
        for (from, deps) in &self.dependencies {
            for to in deps {
                out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DynamicGraph<&'static str> {
        // c depends on b depends on a.
        let mut graph = DynamicGraph::new();
        graph.add_node("a").unwrap();
        graph.add_node("b").unwrap();
        graph.add_node("c").unwrap();
        graph.add_edge(&"b", &"a").unwrap();
        graph.add_edge(&"c", &"b").unwrap();
        graph
    }

    #[test]
    fn free_nodes_follow_dependencies() {
        let mut graph = chain();
        assert_eq!(graph.free_nodes(), ["a"]);

        graph.set_status(&"a", NodeStatus::Running).unwrap();
        assert!(graph.free_nodes().is_empty());

        graph.set_status(&"a", NodeStatus::Finished).unwrap();
        assert_eq!(graph.free_nodes(), ["b"]);

        graph.set_status(&"b", NodeStatus::Running).unwrap();
        graph.set_status(&"b", NodeStatus::Finished).unwrap();
        assert_eq!(graph.free_nodes(), ["c"]);

        graph.set_status(&"c", NodeStatus::Running).unwrap();
        graph.set_status(&"c", NodeStatus::Finished).unwrap();
        assert!(graph.is_drained());
    }

    #[test]
    fn free_nodes_in_insertion_order() {
        let mut graph = DynamicGraph::new();
        for node in ["z", "m", "a"] {
            graph.add_node(node).unwrap();
        }
        assert_eq!(graph.free_nodes(), ["z", "m", "a"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_edge(&"a", &"c"),
            Err(GraphError::EdgeWouldCycle { .. })
        ));
        assert!(matches!(
            graph.add_edge(&"a", &"a"),
            Err(GraphError::EdgeWouldCycle { .. })
        ));
    }

    #[test]
    fn unknown_and_duplicate_nodes_are_rejected() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_edge(&"a", &"nope"),
            Err(GraphError::UnknownNode { .. })
        ));
        assert!(matches!(
            graph.add_node("a"),
            Err(GraphError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let mut graph = chain();

        // ready -> finished skips running.
        assert!(matches!(
            graph.set_status(&"a", NodeStatus::Finished),
            Err(GraphError::InvalidTransition { .. })
        ));

        graph.set_status(&"a", NodeStatus::Running).unwrap();
        // The affinity yield: running -> ready is allowed.
        graph.set_status(&"a", NodeStatus::Ready).unwrap();
        graph.set_status(&"a", NodeStatus::Running).unwrap();
        graph.set_status(&"a", NodeStatus::Finished).unwrap();
        // finished is terminal.
        assert!(matches!(
            graph.set_status(&"a", NodeStatus::Running),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn counts_and_neighbours() {
        let graph = chain();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node_count_with_status(NodeStatus::Ready), 3);
        assert_eq!(graph.dependencies_of(&"c"), ["b"]);
        assert_eq!(graph.successors_of(&"a"), ["b"]);
        assert!(graph.dependencies_of(&"a").is_empty());
    }

    #[test]
    fn dot_rendering_mentions_every_node_and_edge() {
        let graph = chain();
        let dot = graph.to_dot();
        assert!(dot.contains("\"a\""));
        assert!(dot.contains("\"b\" -> \"a\";"));
        assert!(dot.contains("\"c\" -> \"b\";"));
    }
}
