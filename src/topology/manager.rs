//! `TopologyManager`: owns the overlay graph and applies the operations of
//! spec §4.4, including the repair invariant and bounded adaptation.
//!
//! The rebalance-on-threshold shape (compare current metrics to best
//! historical, change only above a threshold and under a rate limit) is
//! grounded in the teacher's `core/swarm_intelligence.rs::rebalance_formations`.

use super::graph::TopologyGraph;
use super::patterns::{connections_for, TopologyPattern};
use crate::agent::{Agent, AgentId};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::{info, warn};

/// Every concrete pattern `maybe_adapt` may switch into. `Dynamic` is
/// excluded: it is a meta-pattern that resolves to `Hierarchical`'s rule
/// rather than a distinct connection topology worth tracking separately.
const ALL_PATTERNS: [TopologyPattern; 5] = [
    TopologyPattern::Mesh,
    TopologyPattern::Hierarchical,
    TopologyPattern::Ring,
    TopologyPattern::Star,
    TopologyPattern::Hybrid,
];

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TopologyMetrics {
    pub density: f64,
    pub centralization: f64,
    pub clustering_coefficient: f64,
    pub avg_path_length: f64,
}

pub struct TopologyManager {
    graph: RwLock<TopologyGraph>,
    pattern: RwLock<TopologyPattern>,
    adaptation_enabled: bool,
    adaptation_threshold: f64,
    max_adaptations_per_hour: u32,
    recent_adaptations: RwLock<VecDeque<chrono::DateTime<chrono::Utc>>>,
    best_metrics_by_pattern: RwLock<HashMap<String, f64>>,
}

impl TopologyManager {
    #[must_use]
    pub fn new(config: &crate::config::TopologyConfig) -> Self {
        Self {
            graph: RwLock::new(TopologyGraph::new()),
            pattern: RwLock::new(TopologyPattern::parse(&config.pattern)),
            adaptation_enabled: config.adaptation_enabled,
            adaptation_threshold: config.adaptation_threshold,
            max_adaptations_per_hour: config.max_adaptations_per_hour,
            recent_adaptations: RwLock::new(VecDeque::new()),
            best_metrics_by_pattern: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn pattern(&self) -> TopologyPattern {
        *self.pattern.read().expect("lock poisoned")
    }

    pub fn add_agent(&self, agent: &Agent, all_agents: &[Agent]) {
        let mut graph = self.graph.write().expect("lock poisoned");
        let pattern = *self.pattern.read().expect("lock poisoned");
        let targets = connections_for(pattern, &graph, agent, all_agents);
        graph.add_vertex(agent.id.clone());
        for target in targets {
            graph.connect(&agent.id, &target);
        }
    }

    /// Removes a vertex and repairs any neighbor left isolated, per the
    /// repair invariant in spec §4.4.
    pub fn remove_agent(&self, id: &AgentId, all_agents: &[Agent]) {
        let mut graph = self.graph.write().expect("lock poisoned");
        let former_neighbors = graph.remove_vertex(id);
        let pattern = *self.pattern.read().expect("lock poisoned");

        for neighbor_id in former_neighbors {
            if graph.degree(&neighbor_id) == 0 && graph.vertex_count() >= 2 {
                if let Some(neighbor_agent) = all_agents.iter().find(|a| a.id == neighbor_id) {
                    let targets = connections_for(pattern, &graph, neighbor_agent, all_agents);
                    let mut connected = false;
                    for target in targets {
                        if target != neighbor_id {
                            graph.connect(&neighbor_id, &target);
                            connected = true;
                            break;
                        }
                    }
                    // When several neighbors are orphaned by the same removal,
                    // the pattern's preferred target can itself be another
                    // still-isolated orphan that resolves to the neighbor
                    // being repaired (e.g. every remaining spoke is at degree
                    // 0 too). Fall back to any other vertex so the "no
                    // isolated vertex once |A| >= 2" invariant still holds.
                    if !connected {
                        if let Some(fallback) = graph.agents().into_iter().find(|other| other != &neighbor_id) {
                            graph.connect(&neighbor_id, &fallback);
                        }
                    }
                }
            }
        }
    }

    /// Atomically replaces the graph under a new pattern, rolling back on
    /// any recompute failure.
    pub fn change_topology(&self, pattern: TopologyPattern, reason: &str, all_agents: &[Agent]) {
        let mut graph = self.graph.write().expect("lock poisoned");
        let previous = graph.clone();
        let mut rebuilt = TopologyGraph::new();

        for agent in all_agents {
            rebuilt.add_vertex(agent.id.clone());
        }
        let mut ok = true;
        for agent in all_agents {
            let targets = connections_for(pattern, &rebuilt, agent, all_agents);
            for target in targets {
                rebuilt.connect(&agent.id, &target);
            }
            if rebuilt.vertex_count() >= 2 && !rebuilt.isolated_vertices().is_empty() {
                // still mid-build; isolation is only a failure once every
                // agent has been processed.
            }
        }
        if rebuilt.vertex_count() >= 2 && !rebuilt.isolated_vertices().is_empty() {
            ok = false;
        }

        if ok {
            *graph = rebuilt;
            *self.pattern.write().expect("lock poisoned") = pattern;
            info!(reason, ?pattern, "topology changed");
        } else {
            *graph = previous;
            warn!(reason, "topology change failed recompute, rolled back");
        }
    }

    #[must_use]
    pub fn metrics(&self) -> TopologyMetrics {
        let graph = self.graph.read().expect("lock poisoned");
        let n = graph.vertex_count();
        if n < 2 {
            return TopologyMetrics::default();
        }
        let agents = graph.agents();
        let max_edges = (n * (n - 1) / 2) as f64;
        let density = graph.edge_count() as f64 / max_edges;

        let degrees: Vec<usize> = agents.iter().map(|id| graph.degree(id)).collect();
        let max_degree = *degrees.iter().max().unwrap_or(&0) as f64;
        let sum_diff: f64 = degrees.iter().map(|&d| max_degree - d as f64).sum();
        let centralization = if n > 2 {
            sum_diff / ((n as f64 - 1.0) * (n as f64 - 2.0))
        } else {
            0.0
        };

        let mut triangle_ratio_sum = 0.0;
        let mut counted = 0;
        for id in &agents {
            let neighbors = graph.neighbors(id);
            let k = neighbors.len();
            if k < 2 {
                continue;
            }
            let mut links = 0;
            for i in 0..neighbors.len() {
                for j in (i + 1)..neighbors.len() {
                    if graph.neighbors(&neighbors[i]).contains(&neighbors[j]) {
                        links += 1;
                    }
                }
            }
            let possible = k * (k - 1) / 2;
            triangle_ratio_sum += links as f64 / possible as f64;
            counted += 1;
        }
        let clustering_coefficient = if counted > 0 {
            triangle_ratio_sum / counted as f64
        } else {
            0.0
        };

        let mut total_distance = 0.0;
        let mut reachable_pairs = 0usize;
        for id in &agents {
            let distances = graph.bfs_distances(id);
            for (_, dist) in distances {
                if dist > 0 {
                    total_distance += dist as f64;
                    reachable_pairs += 1;
                }
            }
        }
        let avg_path_length = if reachable_pairs > 0 {
            total_distance / reachable_pairs as f64
        } else {
            0.0
        };

        TopologyMetrics {
            density,
            centralization,
            clustering_coefficient,
            avg_path_length,
        }
    }

    /// Runs on the adaptation window timer. Records the current pattern's
    /// projected score against its running best, then compares that score
    /// to the best historical score recorded for every *alternative*
    /// pattern (spec §4.4: "current metrics against the best historical
    /// metrics for alternative patterns"). Switches to the strongest
    /// alternative when its historical best clears the improvement
    /// threshold over the current score and the hourly rate limit allows
    /// it; otherwise it just keeps recomputing the running best in place.
    pub fn maybe_adapt(&self, projected_score: f64, all_agents: &[Agent]) {
        if !self.adaptation_enabled {
            return;
        }
        let now = chrono::Utc::now();
        {
            let mut recent = self.recent_adaptations.write().expect("lock poisoned");
            while let Some(front) = recent.front() {
                if now.signed_duration_since(*front) > chrono::Duration::hours(1) {
                    recent.pop_front();
                } else {
                    break;
                }
            }
            if recent.len() as u32 >= self.max_adaptations_per_hour {
                return;
            }
        }

        let current_pattern = *self.pattern.read().expect("lock poisoned");
        let current_key = format!("{current_pattern:?}");
        let mut best = self.best_metrics_by_pattern.write().expect("lock poisoned");
        let prior_best = *best.get(&current_key).unwrap_or(&0.0);
        best.insert(current_key.clone(), projected_score.max(prior_best));

        let best_alternative = ALL_PATTERNS
            .iter()
            .filter(|p| **p != current_pattern)
            .filter_map(|p| {
                let key = format!("{p:?}");
                best.get(&key).map(|score| (*p, *score))
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((candidate, candidate_best)) = best_alternative {
            if projected_score > 0.0 {
                let improvement = (candidate_best - projected_score) / projected_score;
                if improvement > self.adaptation_threshold {
                    drop(best);
                    self.change_topology(candidate, "adaptive improvement", all_agents);
                    self.recent_adaptations
                        .write()
                        .expect("lock poisoned")
                        .push_back(now);
                }
            }
        }
    }

    #[must_use]
    pub fn neighbors(&self, id: &AgentId) -> Vec<AgentId> {
        self.graph.read().expect("lock poisoned").neighbors(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use std::collections::{HashMap as Map, HashSet};

    fn config() -> TopologyConfig {
        TopologyConfig {
            pattern: "mesh".to_string(),
            adaptation_enabled: false,
            adaptation_window_secs: 300,
            adaptation_threshold: 0.15,
            max_adaptations_per_hour: 3,
        }
    }

    fn plain_agent(id: &str) -> Agent {
        Agent::new(AgentId::from(id), "worker", HashSet::new(), Map::new(), false)
    }

    #[test]
    fn mesh_topology_has_no_isolated_vertices_after_inserts() {
        let manager = TopologyManager::new(&config());
        let a = plain_agent("a");
        let b = plain_agent("b");
        let c = plain_agent("c");
        let agents = vec![a.clone(), b.clone(), c.clone()];
        manager.add_agent(&a, &agents);
        manager.add_agent(&b, &agents);
        manager.add_agent(&c, &agents);
        assert!(manager.graph.read().unwrap().isolated_vertices().is_empty());
    }

    #[test]
    fn remove_agent_repairs_orphaned_neighbor() {
        let manager = TopologyManager::new(&config());
        let a = plain_agent("a");
        let b = plain_agent("b");
        let c = plain_agent("c");
        let agents = vec![a.clone(), b.clone(), c.clone()];
        manager.add_agent(&a, &agents);
        manager.add_agent(&b, &agents);
        manager.add_agent(&c, &agents);
        manager.remove_agent(&a.id, &[b.clone(), c.clone()]);
        assert!(manager.graph.read().unwrap().isolated_vertices().is_empty());
    }

    #[test]
    fn maybe_adapt_switches_to_the_stronger_alternative_pattern() {
        let mut cfg = config();
        cfg.adaptation_enabled = true;
        let manager = TopologyManager::new(&cfg);
        let a = plain_agent("a");
        let b = plain_agent("b");
        let c = plain_agent("c");
        let agents = vec![a.clone(), b.clone(), c.clone()];
        manager.add_agent(&a, &agents);
        manager.add_agent(&b, &agents);
        manager.add_agent(&c, &agents);

        // Seed a strong historical score for Star before Mesh ever records one.
        manager
            .best_metrics_by_pattern
            .write()
            .unwrap()
            .insert(format!("{:?}", TopologyPattern::Star), 10.0);

        manager.maybe_adapt(1.0, &agents);

        assert_eq!(*manager.pattern.read().unwrap(), TopologyPattern::Star);
    }

    #[test]
    fn maybe_adapt_is_rate_limited_per_hour() {
        let mut cfg = config();
        cfg.adaptation_enabled = true;
        cfg.max_adaptations_per_hour = 1;
        let manager = TopologyManager::new(&cfg);
        let a = plain_agent("a");
        let agents = vec![a.clone()];
        manager.add_agent(&a, &agents);
        manager
            .recent_adaptations
            .write()
            .unwrap()
            .push_back(chrono::Utc::now());
        manager
            .best_metrics_by_pattern
            .write()
            .unwrap()
            .insert(format!("{:?}", TopologyPattern::Star), 10.0);

        manager.maybe_adapt(1.0, &agents);

        assert_eq!(*manager.pattern.read().unwrap(), TopologyPattern::Mesh);
    }
}
