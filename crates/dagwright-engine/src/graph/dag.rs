use std::collections::HashMap;
use std::fmt;

use dagwright_core::{DagError, Node, Result};

use super::edge::Edge;

/// Directed acyclic graph of nodes.
///
/// The graph owns its nodes and keeps the edge list in insertion order,
/// which is also the order edges are evaluated and reported in. Cycles
/// are only detected when layers are computed, so edges may be added in
/// any order while a graph is being built.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<String, Box<dyn Node>>,
    order: Vec<String>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Fails if a node with the same id already exists.
    pub fn add_node(&mut self, node: impl Node) -> Result<()> {
        self.add_boxed_node(Box::new(node))
    }

    /// Add an already-boxed node, e.g. one built by a loader.
    pub fn add_boxed_node(&mut self, node: Box<dyn Node>) -> Result<()> {
        let id = node.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(DagError::DuplicateNode(id));
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Add an unconditional edge.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        self.insert_edge(Edge::always(from, to))
    }

    /// Add an edge that is only taken when `expr` holds.
    pub fn add_conditional_edge(&mut self, from: &str, to: &str, expr: &str) -> Result<()> {
        self.check_endpoints(from, to)?;
        self.insert_edge(Edge::conditional(from, to, expr)?)
    }

    /// Add a prebuilt edge after validating its endpoints.
    pub fn insert_edge(&mut self, edge: Edge) -> Result<()> {
        self.check_endpoints(&edge.from, &edge.to)?;
        self.edges.push(edge);
        Ok(())
    }

    fn check_endpoints(&self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(DagError::SelfLoop(from.to_string()));
        }
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(DagError::UnknownNode(id.to_string()));
            }
        }
        Ok(())
    }

    /// Get a node by id.
    pub fn node(&self, id: &str) -> Option<&dyn Node> {
        self.nodes.get(id).map(|n| n.as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges ending at `id`, in insertion order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Edges starting at `id`, in insertion order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Nodes without incoming edges, in insertion order.
    pub fn source_nodes(&self) -> Vec<&str> {
        self.node_ids()
            .filter(|id| !self.edges.iter().any(|e| e.to == *id))
            .collect()
    }

    /// Compute execution layers with Kahn's algorithm.
    ///
    /// Every edge counts as a dependency regardless of its condition, so the
    /// schedule includes anything a conditional edge might reach. Each layer
    /// is sorted lexicographically.
    pub fn topological_layers(&self) -> Result<Vec<Vec<String>>> {
        let mut indegree: HashMap<&str, usize> =
            self.order.iter().map(|id| (id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
            if let Some(deg) = indegree.get_mut(edge.to.as_str()) {
                *deg += 1;
            }
        }

        let mut ready: Vec<&str> = self
            .order
            .iter()
            .map(|id| id.as_str())
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut processed = 0;

        while !ready.is_empty() {
            ready.sort_unstable();
            let layer = std::mem::take(&mut ready);

            for id in &layer {
                processed += 1;
                for next in adjacency.get(id).into_iter().flatten() {
                    if let Some(deg) = indegree.get_mut(next) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push(next);
                        }
                    }
                }
            }

            layers.push(layer.into_iter().map(String::from).collect());
        }

        if processed != self.nodes.len() {
            let mut remaining: Vec<String> = indegree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            remaining.sort();
            return Err(DagError::Cycle { remaining });
        }

        Ok(layers)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<(&str, &str)> = self
            .order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (id.as_str(), n.kind())))
            .collect();
        f.debug_struct("Graph")
            .field("nodes", &nodes)
            .field("edges", &self.edges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagwright_test_utils::StaticNode;

    fn graph_with(ids: &[&str]) -> Graph {
        let mut g = Graph::new();
        for id in ids {
            g.add_node(StaticNode::empty(*id)).unwrap();
        }
        g
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = graph_with(&["a"]);
        let err = g.add_node(StaticNode::empty("a")).unwrap_err();
        assert!(matches!(err, DagError::DuplicateNode(id) if id == "a"));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let mut g = graph_with(&["a"]);
        assert!(matches!(g.add_edge("a", "b"), Err(DagError::UnknownNode(id)) if id == "b"));
        assert!(matches!(g.add_edge("z", "a"), Err(DagError::UnknownNode(id)) if id == "z"));
        assert!(g.edges().is_empty());
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut g = graph_with(&["a"]);
        assert!(matches!(g.add_edge("a", "a"), Err(DagError::SelfLoop(_))));
    }

    #[test]
    fn test_invalid_condition_rejected_at_construction() {
        let mut g = graph_with(&["a", "b"]);
        let err = g.add_conditional_edge("a", "b", "a.x ==").unwrap_err();
        assert!(matches!(err, DagError::InvalidCondition { .. }));
        assert!(g.edges().is_empty());
    }

    #[test]
    fn test_layers_diamond() {
        let mut g = graph_with(&["d", "b", "c", "a"]);
        g.add_edge("a", "b").unwrap();
        g.add_edge("a", "c").unwrap();
        g.add_edge("b", "d").unwrap();
        g.add_edge("c", "d").unwrap();

        let layers = g.topological_layers().unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_layers_sorted_and_conditions_ignored() {
        let mut g = graph_with(&["z", "y", "x"]);
        g.add_conditional_edge("z", "x", "z.never").unwrap();

        let layers = g.topological_layers().unwrap();
        assert_eq!(layers, vec![vec!["y", "z"], vec!["x"]]);
    }

    #[test]
    fn test_edges_added_before_order_is_acyclic() {
        // Edges may be inserted in any order relative to the final layering.
        let mut g = graph_with(&["c", "b", "a"]);
        g.add_edge("b", "c").unwrap();
        g.add_edge("a", "b").unwrap();
        assert_eq!(
            g.topological_layers().unwrap(),
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
    }

    #[test]
    fn test_every_node_in_exactly_one_layer() {
        let mut g = graph_with(&["a", "b", "c", "d", "e", "f"]);
        g.add_edge("a", "d").unwrap();
        g.add_edge("b", "d").unwrap();
        g.add_edge("d", "e").unwrap();
        g.add_edge("c", "e").unwrap();
        g.add_edge("a", "e").unwrap();

        let layers = g.topological_layers().unwrap();
        let mut seen: Vec<&str> = layers.iter().flatten().map(|s| s.as_str()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e", "f"]);

        let position = |id: &str| layers.iter().position(|l| l.iter().any(|n| n == id)).unwrap();
        for edge in g.edges() {
            assert!(position(&edge.from) < position(&edge.to));
        }
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = graph_with(&["a", "b", "c", "d"]);
        g.add_edge("a", "b").unwrap();
        g.add_edge("b", "c").unwrap();
        g.add_edge("c", "b").unwrap();
        g.add_edge("c", "d").unwrap();

        match g.topological_layers() {
            Err(DagError::Cycle { remaining }) => assert_eq!(remaining, vec!["b", "c", "d"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_graph_has_no_layers() {
        assert!(Graph::new().topological_layers().unwrap().is_empty());
    }

    #[test]
    fn test_source_nodes_and_adjacency() {
        let mut g = graph_with(&["a", "b", "c"]);
        g.add_edge("a", "c").unwrap();
        g.add_conditional_edge("b", "c", "b.ok").unwrap();

        assert_eq!(g.source_nodes(), vec!["a", "b"]);
        assert_eq!(g.incoming("c").count(), 2);
        assert_eq!(g.outgoing("a").map(|e| e.to.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(g.node_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(g.node("a").map(|n| n.kind()), Some("static"));
    }
}
