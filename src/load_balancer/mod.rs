//! Load balancer: agent-selection strategies over the current agent set.
//!
//! Grounded in the teacher's `infrastructure/cpu_load_balancer.rs` for
//! texture (config struct, scoring-by-formula style, `#[cfg(test)]`
//! placement) and `core/swarm_intelligence.rs` for the pattern-dispatch
//! shape, generalized to the seven named strategies of spec §4.3.

mod strategy;

pub use strategy::{LoadBalancerStrategy, SelectionStrategy};

use crate::agent::{Agent, AgentId, ResourceKind};
use crate::config::LoadBalancerStrategyConfig;
use crate::failure_recovery::CircuitBreakerRegistry;
use crate::task::Task;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

/// Eligibility filter shared by every strategy (spec §4.3 a-f).
pub fn is_eligible(
    agent: &Agent,
    task: &Task,
    exclude: &std::collections::HashSet<AgentId>,
    circuit_breakers: &CircuitBreakerRegistry,
) -> bool {
    use crate::agent::{AgentState, HealthStatus};

    if exclude.contains(&agent.id) {
        return false;
    }
    if !matches!(agent.state, AgentState::Idle | AgentState::Busy) {
        return false;
    }
    if agent.health.status == HealthStatus::Unhealthy {
        return false;
    }
    if !task
        .required_capabilities
        .iter()
        .all(|c| agent.has_capability(c))
    {
        return false;
    }
    if !agent.can_satisfy(&task.required_resources) {
        return false;
    }
    let concurrent_total = agent
        .resources
        .get(&ResourceKind::ConcurrentTasks)
        .map(|q| q.total)
        .unwrap_or(f64::INFINITY);
    if agent.task_count as f64 >= concurrent_total {
        return false;
    }
    if circuit_breakers.is_open(&agent.id) {
        return false;
    }
    true
}

/// Owns the configured strategy and the round-robin cursor it may need.
pub struct LoadBalancer {
    strategy: LoadBalancerStrategy,
    round_robin_cursor: AtomicUsize,
    weights: DashMap<AgentId, f64>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(config: &LoadBalancerStrategyConfig) -> Self {
        Self {
            strategy: LoadBalancerStrategy::from_config(config),
            round_robin_cursor: AtomicUsize::new(0),
            weights: DashMap::new(),
        }
    }

    /// `Select(task, exclude) -> AgentId | None`, the spec §4.3 contract.
    pub fn select(
        &self,
        task: &Task,
        exclude: &std::collections::HashSet<AgentId>,
        agents: &[Agent],
        circuit_breakers: &CircuitBreakerRegistry,
    ) -> Option<AgentId> {
        let eligible: Vec<&Agent> = agents
            .iter()
            .filter(|a| is_eligible(a, task, exclude, circuit_breakers))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        self.strategy
            .select(&eligible, &self.weights, &self.round_robin_cursor)
    }

    /// Recompute every agent's weight per the formula in spec §4.3,
    /// called from the 60s weight-recompute timer.
    pub fn recompute_weights(&self, agents: &[Agent]) {
        for agent in agents {
            let health_score = match agent.health.status {
                crate::agent::HealthStatus::Healthy => 1.0,
                crate::agent::HealthStatus::Warning => 0.5,
                crate::agent::HealthStatus::Unhealthy => 0.0,
            };
            let weight = 0.5
                + 0.4 * agent.metrics.success_rate
                + 0.2 * health_score
                + 0.2 * (1.0 - agent.metrics.current_load)
                + 0.2 * (agent.metrics.throughput / 10.0).min(1.0);
            let clamped = weight.clamp(0.1, 1.0);
            self.weights.insert(agent.id.clone(), clamped);
        }
    }

    #[must_use]
    pub fn weight_of(&self, id: &AgentId) -> f64 {
        self.weights.get(id).map(|w| *w).unwrap_or(1.0)
    }
}

/// The mean over resource kinds of `(total-available)/total`, recomputed
/// on every accounting change and on the 30s load timer (spec §4.3).
#[must_use]
pub fn compute_load(resources: &HashMap<ResourceKind, crate::agent::ResourceQuota>) -> f64 {
    if resources.is_empty() {
        return 0.0;
    }
    let sum: f64 = resources
        .values()
        .map(|q| {
            if q.total <= 0.0 {
                0.0
            } else {
                (q.total - q.available) / q.total
            }
        })
        .sum();
    sum / resources.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ResourceQuota;

    #[test]
    fn load_is_mean_utilization() {
        let mut resources = HashMap::new();
        resources.insert(ResourceKind::Cpu, ResourceQuota { total: 4.0, available: 2.0 });
        resources.insert(
            ResourceKind::ConcurrentTasks,
            ResourceQuota { total: 8.0, available: 8.0 },
        );
        assert!((compute_load(&resources) - 0.25).abs() < 1e-9);
    }
}
