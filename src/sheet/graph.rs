//! Dependency graph between cells.
//!
//! An edge `a -> b` means `b` reads `a`, so `a` must be computed first.
//! Edges that would close a cycle are rejected when added, which keeps
//! [`DependencyGraph::topological_sort`] total.

use std::collections::{HashMap, HashSet};

use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;

use super::error::GraphError;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    node_index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name` if missing and return its index.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.node_index.get(name) {
            idx
        } else {
            let idx = self.graph.add_node(name.to_string());
            self.node_index.insert(name.to_string(), idx);
            idx
        }
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_index.contains_key(name)
    }

    /// Add `from -> to`, creating both nodes. Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let u = self.add_node(from);
        let v = self.add_node(to);
        if self.graph.contains_edge(u, v) {
            return Ok(());
        }
        if u == v || has_path_connecting(&self.graph, v, u, None) {
            return Err(GraphError::Cycle {
                from: from.into(),
                to: to.into(),
            });
        }
        self.graph.add_edge(u, v, ());
        Ok(())
    }

    /// Whether `to` is reachable from `from`.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        match (self.node_index.get(from), self.node_index.get(to)) {
            (Some(&u), Some(&v)) => has_path_connecting(&self.graph, u, v, None),
            _ => false,
        }
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) {
        let (Some(&u), Some(&v)) = (self.node_index.get(from), self.node_index.get(to)) else {
            return;
        };
        if let Some(edge) = self.graph.find_edge(u, v) {
            self.graph.remove_edge(edge);
        }
    }

    /// Detach `name` from everything it reads.
    pub fn remove_incoming_edges(&mut self, name: &str) {
        let Some(&idx) = self.node_index.get(name) else {
            return;
        };
        let incoming: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in incoming {
            self.graph.remove_edge(edge);
        }
    }

    /// Remove `name` and every edge touching it.
    pub fn remove_node(&mut self, name: &str) {
        self.remove_incoming_edges(name);
        if let Some(idx) = self.node_index.remove(name) {
            self.graph.remove_node(idx);
        }
    }

    /// Cells that read `name`, sorted.
    pub fn adjacent(&self, name: &str) -> Vec<String> {
        let Some(&idx) = self.node_index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        out.sort();
        out
    }

    /// Every edge as `(from, to)`, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?.clone();
                let to = self.graph.node_weight(e.target())?.clone();
                Some((from, to))
            })
            .collect();
        out.sort();
        out
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        // popped from the back; siblings come out in name order once the
        // postorder is reversed
        children.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        children
    }

    /// Every node reachable from `seeds`, each once, with every node after
    /// the nodes it reads.
    ///
    /// Depth-first with an explicit stack, so deep chains cannot overflow.
    /// Seeds missing from the graph are returned as isolated nodes.
    pub fn topological_sort<S: AsRef<str>>(&self, seeds: &[S]) -> Vec<String> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut emitted: HashSet<&str> = HashSet::new();
        let mut postorder: Vec<String> = Vec::new();

        for seed in seeds {
            let seed = seed.as_ref();
            let Some(&start) = self.node_index.get(seed) else {
                if emitted.insert(seed) {
                    postorder.push(seed.to_string());
                }
                continue;
            };
            if !visited.insert(start) {
                continue;
            }

            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, self.children(start))];
            while let Some((node, children)) = stack.last_mut() {
                match children.pop() {
                    Some(child) => {
                        if visited.insert(child) {
                            let grandchildren = self.children(child);
                            stack.push((child, grandchildren));
                        }
                    }
                    None => {
                        postorder.push(self.graph[*node].clone());
                        stack.pop();
                    }
                }
            }
        }

        postorder.reverse();
        postorder
    }

    /// Render as Graphviz DOT. `!` in names becomes `_`.
    pub fn generate_dot(&self) -> String {
        let mut names: Vec<&String> = self.node_index.keys().collect();
        names.sort();

        let mut lines = Vec::new();
        for name in names {
            let adjacent = self.adjacent(name);
            if !adjacent.is_empty() {
                lines.push(format!("  {} -> {{{}}}", name, adjacent.join(",")));
            }
        }
        format!("digraph G {{\n{}\n}}", lines.join("\n")).replace('!', "_")
    }
}
