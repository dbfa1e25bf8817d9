//! `TopologyGraph`: an undirected overlay graph over the current agent set.
//!
//! Grounded in the teacher's use of `petgraph` (already a teacher
//! dependency) though the teacher itself never builds an explicit topology
//! graph — `core/swarm_intelligence.rs`'s formation-membership lists are the
//! closest precedent for "a set of agents with a connection structure",
//! generalized here into a real `petgraph::UnGraph` with the invariants
//! spec §3 names (symmetry, no self-loops, no isolated vertices once
//! |A| >= 2).

use crate::agent::AgentId;
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    graph: UnGraph<AgentId, ()>,
    index_of: HashMap<AgentId, NodeIndex>,
}

impl TopologyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn agents(&self) -> Vec<AgentId> {
        self.index_of.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, id: &AgentId) -> bool {
        self.index_of.contains_key(id)
    }

    pub fn add_vertex(&mut self, id: AgentId) -> NodeIndex {
        *self
            .index_of
            .entry(id.clone())
            .or_insert_with(|| self.graph.add_node(id))
    }

    /// Adds a symmetric edge; no-op if either endpoint is missing, and
    /// refuses self-loops.
    pub fn connect(&mut self, a: &AgentId, b: &AgentId) {
        if a == b {
            return;
        }
        let (Some(&ia), Some(&ib)) = (self.index_of.get(a), self.index_of.get(b)) else {
            return;
        };
        if !self.graph.contains_edge(ia, ib) {
            self.graph.add_edge(ia, ib, ());
        }
    }

    #[must_use]
    pub fn neighbors(&self, id: &AgentId) -> Vec<AgentId> {
        let Some(&index) = self.index_of.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors(index)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    #[must_use]
    pub fn degree(&self, id: &AgentId) -> usize {
        self.index_of
            .get(id)
            .map(|&index| self.graph.neighbors(index).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Removes the vertex and reports its former neighbors, so the caller
    /// can apply the repair invariant (reconnect orphans).
    pub fn remove_vertex(&mut self, id: &AgentId) -> Vec<AgentId> {
        let Some(index) = self.index_of.remove(id) else {
            return Vec::new();
        };
        let former_neighbors: Vec<AgentId> = self
            .graph
            .neighbors(index)
            .map(|n| self.graph[n].clone())
            .collect();
        self.graph.remove_node(index);
        // `remove_node` swap-removes the last index into the freed slot;
        // petgraph updates edges internally, but our id->index map must be
        // rebuilt for the moved node.
        self.reindex();
        former_neighbors
    }

    fn reindex(&mut self) {
        self.index_of.clear();
        for index in self.graph.node_indices() {
            self.index_of.insert(self.graph[index].clone(), index);
        }
    }

    #[must_use]
    pub fn isolated_vertices(&self) -> Vec<AgentId> {
        if self.vertex_count() < 2 {
            return Vec::new();
        }
        self.graph
            .node_indices()
            .filter(|&index| self.graph.neighbors(index).count() == 0)
            .map(|index| self.graph[index].clone())
            .collect()
    }

    /// BFS shortest-path lengths from `source` to every reachable vertex.
    #[must_use]
    pub fn bfs_distances(&self, source: &AgentId) -> HashMap<AgentId, usize> {
        use std::collections::VecDeque;
        let mut distances = HashMap::new();
        let Some(&start) = self.index_of.get(source) else {
            return distances;
        };
        distances.insert(source.clone(), 0);
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            let current_dist = distances[&self.graph[current]];
            for neighbor in self.graph.neighbors(current) {
                let neighbor_id = self.graph[neighbor].clone();
                if !distances.contains_key(&neighbor_id) {
                    distances.insert(neighbor_id, current_dist + 1);
                    queue.push_back(neighbor);
                }
            }
        }
        distances
    }
}
