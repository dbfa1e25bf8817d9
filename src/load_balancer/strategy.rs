//! The seven agent-selection strategies from spec §4.3.

use crate::agent::{Agent, AgentId};
use crate::config::LoadBalancerStrategyConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait SelectionStrategy {
    fn select(
        &self,
        eligible: &[&Agent],
        weights: &DashMap<AgentId, f64>,
        round_robin_cursor: &AtomicUsize,
    ) -> Option<AgentId>;
}

pub enum LoadBalancerStrategy {
    RoundRobin,
    LeastLoaded,
    WeightedRoundRobin,
    ResourceAware,
    PerformanceBased,
    Predictive,
    Adaptive,
}

impl LoadBalancerStrategy {
    #[must_use]
    pub fn from_config(config: &LoadBalancerStrategyConfig) -> Self {
        match config {
            LoadBalancerStrategyConfig::RoundRobin => Self::RoundRobin,
            LoadBalancerStrategyConfig::LeastLoaded => Self::LeastLoaded,
            LoadBalancerStrategyConfig::WeightedRoundRobin => Self::WeightedRoundRobin,
            LoadBalancerStrategyConfig::ResourceAware => Self::ResourceAware,
            LoadBalancerStrategyConfig::PerformanceBased => Self::PerformanceBased,
            LoadBalancerStrategyConfig::Predictive => Self::Predictive,
            LoadBalancerStrategyConfig::Adaptive => Self::Adaptive,
        }
    }

    pub fn select(
        &self,
        eligible: &[&Agent],
        weights: &DashMap<AgentId, f64>,
        round_robin_cursor: &AtomicUsize,
    ) -> Option<AgentId> {
        match self {
            Self::RoundRobin => round_robin(eligible, round_robin_cursor),
            Self::LeastLoaded => least_loaded(eligible),
            Self::WeightedRoundRobin => weighted_round_robin(eligible, weights, round_robin_cursor),
            Self::ResourceAware => resource_aware(eligible),
            Self::PerformanceBased => performance_based(eligible),
            Self::Predictive => predictive(eligible),
            Self::Adaptive => adaptive(eligible),
        }
    }
}

fn sorted_ids(eligible: &[&Agent]) -> Vec<&AgentId> {
    let mut ids: Vec<&AgentId> = eligible.iter().map(|a| &a.id).collect();
    ids.sort();
    ids
}

fn round_robin(eligible: &[&Agent], cursor: &AtomicUsize) -> Option<AgentId> {
    let ids = sorted_ids(eligible);
    if ids.is_empty() {
        return None;
    }
    let index = cursor.fetch_add(1, Ordering::Relaxed) % ids.len();
    Some(ids[index].clone())
}

fn least_loaded(eligible: &[&Agent]) -> Option<AgentId> {
    eligible
        .iter()
        .min_by(|a, b| {
            a.metrics
                .current_load
                .partial_cmp(&b.metrics.current_load)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.task_count.cmp(&b.task_count))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|a| a.id.clone())
}

fn weighted_round_robin(
    eligible: &[&Agent],
    weights: &DashMap<AgentId, f64>,
    cursor: &AtomicUsize,
) -> Option<AgentId> {
    if eligible.is_empty() {
        return None;
    }
    let mut ids = sorted_ids(eligible);
    ids.sort();
    let weighted: Vec<(AgentId, f64)> = ids
        .into_iter()
        .map(|id| (id.clone(), weights.get(id).map(|w| *w).unwrap_or(1.0)))
        .collect();
    let total_weight: f64 = weighted.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return round_robin(eligible, cursor);
    }
    // Deterministic weighted selection: treat the cursor as a position that
    // sweeps the cumulative-weight line, so repeated calls approximate the
    // weight distribution without needing a random source.
    let position = cursor.fetch_add(1, Ordering::Relaxed) as f64 % total_weight;
    let mut running = 0.0;
    for (id, weight) in &weighted {
        running += weight;
        if position < running {
            return Some(id.clone());
        }
    }
    weighted.last().map(|(id, _)| id.clone())
}

fn resource_aware(eligible: &[&Agent]) -> Option<AgentId> {
    eligible
        .iter()
        .max_by(|a, b| {
            resource_aware_score(a)
                .partial_cmp(&resource_aware_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|a| a.id.clone())
}

fn resource_aware_score(agent: &Agent) -> f64 {
    if agent.resources.is_empty() {
        return 0.3 * (1.0 - agent.metrics.current_load);
    }
    let mean_utilization: f64 = agent
        .resources
        .values()
        .map(|q| if q.total <= 0.0 { 0.0 } else { (q.total - q.available) / q.total })
        .sum::<f64>()
        / agent.resources.len() as f64;
    0.7 * (1.0 - mean_utilization) + 0.3 * (1.0 - agent.metrics.current_load)
}

fn performance_based(eligible: &[&Agent]) -> Option<AgentId> {
    eligible
        .iter()
        .max_by(|a, b| {
            performance_score(a)
                .partial_cmp(&performance_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|a| a.id.clone())
}

fn performance_score(agent: &Agent) -> f64 {
    let health_score = match agent.health.status {
        crate::agent::HealthStatus::Healthy => 1.0,
        crate::agent::HealthStatus::Warning => 0.5,
        crate::agent::HealthStatus::Unhealthy => 0.0,
    };
    let avg_exec_ms = agent.metrics.average_execution_time_ns / 1_000_000.0;
    let speed_term = if avg_exec_ms <= 0.0 {
        1.0
    } else {
        (10_000.0 / avg_exec_ms).min(1.0)
    };
    0.4 * agent.metrics.success_rate
        + 0.3 * (agent.metrics.throughput / 10.0).min(1.0)
        + 0.2 * speed_term
        + 0.1 * health_score
}

/// No trained model is wired into the CORE; per spec §4.6 this always falls
/// back to PerformanceBased scoring.
fn predictive(eligible: &[&Agent]) -> Option<AgentId> {
    performance_based(eligible)
}

fn adaptive(eligible: &[&Agent]) -> Option<AgentId> {
    if eligible.is_empty() {
        return None;
    }
    let mut votes: std::collections::HashMap<AgentId, f64> = std::collections::HashMap::new();
    if let Some(id) = least_loaded(eligible) {
        *votes.entry(id).or_insert(0.0) += 0.3;
    }
    if let Some(id) = resource_aware(eligible) {
        *votes.entry(id).or_insert(0.0) += 0.3;
    }
    if let Some(id) = performance_based(eligible) {
        *votes.entry(id).or_insert(0.0) += 0.4;
    }
    votes
        .into_iter()
        .max_by(|(id_a, score_a), (id_b, score_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| id_b.cmp(id_a))
        })
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentId, AgentMetrics};
    use std::collections::{HashMap, HashSet};

    fn agent_with(id: &str, load: f64, success_rate: f64) -> Agent {
        let mut a = Agent::new(
            AgentId::from(id),
            "worker",
            HashSet::new(),
            HashMap::new(),
            false,
        );
        a.metrics = AgentMetrics {
            current_load: load,
            success_rate,
            ..AgentMetrics::default()
        };
        a
    }

    #[test]
    fn least_loaded_picks_minimum_load() {
        let a1 = agent_with("a1", 0.8, 1.0);
        let a2 = agent_with("a2", 0.2, 1.0);
        let eligible = vec![&a1, &a2];
        assert_eq!(least_loaded(&eligible), Some(AgentId::from("a2")));
    }

    #[test]
    fn round_robin_advances_cursor() {
        let a1 = agent_with("a1", 0.0, 1.0);
        let a2 = agent_with("a2", 0.0, 1.0);
        let eligible = vec![&a1, &a2];
        let cursor = AtomicUsize::new(0);
        let first = round_robin(&eligible, &cursor);
        let second = round_robin(&eligible, &cursor);
        assert_ne!(first, second);
    }

    #[test]
    fn performance_based_prefers_higher_success_rate() {
        let a1 = agent_with("a1", 0.0, 0.2);
        let a2 = agent_with("a2", 0.0, 0.9);
        let eligible = vec![&a1, &a2];
        assert_eq!(performance_based(&eligible), Some(AgentId::from("a2")));
    }
}
