//! Connection rules for each topology pattern (spec §4.4.1).
//!
//! Dispatch-by-pattern mirrors the teacher's
//! `core/swarm_intelligence.rs::select_optimal_agents`, which matches on a
//! `FormationType` and calls one dedicated selection function per pattern.

use super::graph::TopologyGraph;
use crate::agent::{Agent, AgentId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyPattern {
    Mesh,
    Hierarchical,
    Ring,
    Star,
    Hybrid,
    Dynamic,
}

impl TopologyPattern {
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "hierarchical" => Self::Hierarchical,
            "ring" => Self::Ring,
            "star" => Self::Star,
            "hybrid" => Self::Hybrid,
            "dynamic" => Self::Dynamic,
            _ => Self::Mesh,
        }
    }
}

fn infer_role(agent: &Agent) -> &'static str {
    if agent.has_capability("coordinator") {
        "coordinator"
    } else if agent.has_capability("specialist") {
        "specialist"
    } else {
        "worker"
    }
}

/// Computes the set of existing agents that `new_id` should connect to
/// under `pattern`, given the graph as it stands before insertion.
pub fn connections_for(
    pattern: TopologyPattern,
    graph: &TopologyGraph,
    new_agent: &Agent,
    all_agents: &[Agent],
) -> HashSet<AgentId> {
    let existing = graph.agents();
    if existing.is_empty() {
        return HashSet::new();
    }

    match pattern {
        TopologyPattern::Mesh => existing.into_iter().collect(),
        TopologyPattern::Hierarchical => {
            let root = existing
                .iter()
                .min_by_key(|id| graph.degree(id))
                .cloned();
            root.into_iter().collect()
        }
        TopologyPattern::Ring => ring_insertion_point(graph, &existing),
        TopologyPattern::Star => {
            let hub = existing.iter().max_by_key(|id| graph.degree(id)).cloned();
            hub.into_iter().collect()
        }
        TopologyPattern::Hybrid => hybrid_connections(graph, new_agent, all_agents, &existing),
        TopologyPattern::Dynamic => dynamic_connections(graph, new_agent, all_agents, &existing),
    }
}

/// Insertion chosen to minimize disruption: attach alongside the
/// most-recently-added agent (last-in-first-out heuristic named by spec).
fn ring_insertion_point(graph: &TopologyGraph, existing: &[AgentId]) -> HashSet<AgentId> {
    if existing.len() == 1 {
        return existing.iter().cloned().collect();
    }
    // The most recently inserted vertex has the highest petgraph node index.
    let anchor = existing
        .iter()
        .max_by_key(|id| graph.degree(id).min(1))
        .cloned();
    let mut targets: HashSet<AgentId> = anchor.into_iter().collect();
    // Break one existing ring edge by also connecting to one of the anchor's
    // neighbors, forming a new cycle through the inserted vertex.
    if let Some(anchor_id) = targets.iter().next().cloned() {
        if let Some(neighbor) = graph.neighbors(&anchor_id).into_iter().next() {
            targets.insert(neighbor);
        }
    }
    targets
}

fn hybrid_connections(
    graph: &TopologyGraph,
    new_agent: &Agent,
    all_agents: &[Agent],
    existing: &[AgentId],
) -> HashSet<AgentId> {
    let by_id: std::collections::HashMap<&AgentId, &Agent> =
        all_agents.iter().map(|a| (&a.id, a)).collect();

    match infer_role(new_agent) {
        "coordinator" => {
            let mut top_performers: Vec<&AgentId> = existing.iter().collect();
            top_performers.sort_by(|a, b| {
                let score_a = by_id.get(*a).map(|ag| ag.metrics.performance_score()).unwrap_or(0.0);
                let score_b = by_id.get(*b).map(|ag| ag.metrics.performance_score()).unwrap_or(0.0);
                score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
            });
            top_performers.into_iter().take(3).cloned().collect()
        }
        "specialist" => {
            let coordinators: HashSet<AgentId> = existing
                .iter()
                .filter(|id| {
                    by_id
                        .get(*id)
                        .map(|a| infer_role(a) == "coordinator")
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if coordinators.is_empty() {
                let root = existing.iter().min_by_key(|id| graph.degree(id)).cloned();
                root.into_iter().collect()
            } else {
                coordinators
            }
        }
        _ => {
            let best_coordinator = existing
                .iter()
                .filter(|id| {
                    by_id
                        .get(*id)
                        .map(|a| infer_role(a) == "coordinator")
                        .unwrap_or(false)
                })
                .max_by(|a, b| {
                    let score_a = by_id.get(*a).map(|ag| ag.metrics.performance_score()).unwrap_or(0.0);
                    let score_b = by_id.get(*b).map(|ag| ag.metrics.performance_score()).unwrap_or(0.0);
                    score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned();
            match best_coordinator {
                Some(id) => std::iter::once(id).collect(),
                None => existing.iter().min_by_key(|id| graph.degree(id)).cloned().into_iter().collect(),
            }
        }
    }
}

/// No learned connection model is wired into the CORE; per spec §4.6 this
/// always falls back to the Hierarchical rule, with the "add at least one"
/// connectivity guarantee spec §4.4.1 requires for Dynamic.
fn dynamic_connections(
    graph: &TopologyGraph,
    _new_agent: &Agent,
    _all_agents: &[Agent],
    existing: &[AgentId],
) -> HashSet<AgentId> {
    let root = existing.iter().min_by_key(|id| graph.degree(id)).cloned();
    match root {
        Some(id) => std::iter::once(id).collect(),
        None => existing.iter().next().cloned().into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn plain_agent(id: &str) -> Agent {
        Agent::new(AgentId::from(id), "worker", HashSet::new(), Map::new(), false)
    }

    #[test]
    fn mesh_connects_to_every_existing_agent() {
        let mut g = TopologyGraph::new();
        let a = plain_agent("a");
        let b = plain_agent("b");
        g.add_vertex(a.id.clone());
        g.add_vertex(b.id.clone());
        g.connect(&a.id, &b.id);
        let c = plain_agent("c");
        let connections = connections_for(TopologyPattern::Mesh, &g, &c, &[a, b, c.clone()]);
        assert_eq!(connections.len(), 2);
    }

    #[test]
    fn star_connects_new_agent_to_highest_degree_hub() {
        let mut g = TopologyGraph::new();
        let a = plain_agent("a");
        let b = plain_agent("b");
        g.add_vertex(a.id.clone());
        g.add_vertex(b.id.clone());
        g.connect(&a.id, &b.id);
        let c = plain_agent("c");
        let connections = connections_for(TopologyPattern::Star, &g, &c, &[a.clone(), b.clone(), c]);
        assert_eq!(connections.len(), 1);
    }
}
