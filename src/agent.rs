//! Agent data model.
//!
//! Grounded in the teacher's `core/hive/agent_management/types.rs`
//! (`AgentMetrics`, performance scoring) and `agent.rs` (capability set,
//! state enum shape), generalized to the resource-typed, weight-bearing
//! Agent the coordinator's load balancer and topology manager need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Opaque, stable agent identity. Generated on first registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Resource categories an agent can be constrained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Network,
    ConcurrentTasks,
}

pub const ALL_RESOURCE_KINDS: [ResourceKind; 4] = [
    ResourceKind::Cpu,
    ResourceKind::Memory,
    ResourceKind::Network,
    ResourceKind::ConcurrentTasks,
];

/// A total/available pair for one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub total: f64,
    pub available: f64,
}

impl ResourceQuota {
    #[must_use]
    pub fn new(total: f64) -> Self {
        Self {
            total,
            available: total,
        }
    }
}

/// Agent lifecycle state, transitions enforced by the orchestrator per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Initializing,
    Idle,
    Busy,
    Paused,
    Failed,
    Terminated,
    Migrating,
}

impl AgentState {
    /// Whether `self -> next` is a legal transition under the agent state machine.
    #[must_use]
    pub fn can_transition(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Initializing, Idle)
                | (Initializing, Failed)
                | (Idle, Busy)
                | (Idle, Paused)
                | (Idle, Failed)
                | (Idle, Terminated)
                | (Busy, Idle)
                | (Busy, Failed)
                | (Busy, Terminated)
                | (Busy, Migrating)
                | (Paused, Idle)
                | (Paused, Failed)
                | (Paused, Terminated)
                | (Failed, Idle)
                | (Failed, Terminated)
                | (Migrating, Idle)
                | (Migrating, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
            last_heartbeat: Utc::now(),
        }
    }
}

/// Rolling performance metrics, the same shape the teacher's `AgentMetrics`
/// tracks, extended with load/throughput/error-rate for load-balancer use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub total_tasks: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_execution_time_ns: u64,
    pub average_execution_time_ns: f64,
    pub success_rate: f64,
    pub current_load: f64,
    pub throughput: f64,
    pub error_rate: f64,
    /// task completion timestamps within the last 60s, for the throughput window.
    #[serde(skip)]
    pub(crate) recent_completions: Vec<DateTime<Utc>>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            total_tasks: 0,
            completed: 0,
            failed: 0,
            total_execution_time_ns: 0,
            average_execution_time_ns: 0.0,
            success_rate: 1.0,
            current_load: 0.0,
            throughput: 0.0,
            error_rate: 0.0,
            recent_completions: Vec::new(),
        }
    }
}

impl AgentMetrics {
    /// `score = success_rate * min(2.0, 1000.0 / average_execution_time_ms)`,
    /// the same formula the teacher uses for `AgentMetrics::performance_score`.
    #[must_use]
    pub fn performance_score(&self) -> f64 {
        let avg_ms = self.average_execution_time_ns / 1_000_000.0;
        if avg_ms <= 0.0 {
            return self.success_rate;
        }
        self.success_rate * (2.0_f64).min(1000.0 / avg_ms)
    }

    pub fn record_completion(&mut self, execution_time_ns: u64, success: bool, now: DateTime<Utc>) {
        self.total_tasks += 1;
        self.total_execution_time_ns += execution_time_ns;
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.average_execution_time_ns =
            self.total_execution_time_ns as f64 / self.total_tasks.max(1) as f64;
        self.success_rate = self.completed as f64 / self.total_tasks.max(1) as f64;
        self.error_rate = self.failed as f64 / self.total_tasks.max(1) as f64;

        self.recent_completions.push(now);
        self.recent_completions
            .retain(|t| now.signed_duration_since(*t).num_seconds() <= 60);
        self.throughput = self.recent_completions.len() as f64;
    }
}

/// A worker participating in the swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub kind: String,
    pub capabilities: HashSet<String>,
    pub resources: HashMap<ResourceKind, ResourceQuota>,
    pub state: AgentState,
    /// True once a `register` message has arrived; a connection may still be
    /// absent (worker disconnected) without implying `Failed`.
    pub connected: bool,
    pub health: AgentHealth,
    pub metrics: AgentMetrics,
    /// Derived weight in [0.1, 1.0], recomputed by the load balancer.
    pub weight: f64,
    /// True when this agent registered without a prior `SpawnAgent` call.
    pub externally_managed: bool,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    #[must_use]
    pub fn new(
        id: AgentId,
        kind: impl Into<String>,
        capabilities: HashSet<String>,
        resource_totals: HashMap<ResourceKind, f64>,
        externally_managed: bool,
    ) -> Self {
        let resources = resource_totals
            .into_iter()
            .map(|(kind, total)| (kind, ResourceQuota::new(total)))
            .collect();

        Self {
            id,
            kind: kind.into(),
            capabilities,
            resources,
            state: AgentState::Initializing,
            connected: false,
            health: AgentHealth::default(),
            metrics: AgentMetrics::default(),
            weight: 1.0,
            externally_managed,
            task_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Attempt a state transition, returning whether it was legal.
    pub fn try_transition(&mut self, next: AgentState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    #[must_use]
    pub fn can_satisfy(&self, required: &HashMap<ResourceKind, f64>) -> bool {
        required.iter().all(|(kind, amount)| {
            self.resources
                .get(kind)
                .is_some_and(|quota| quota.available >= *amount)
        })
    }

    /// Reserves resources for a newly assigned task and, if this is the
    /// agent's first outstanding task, transitions it `Idle -> Busy`
    /// (spec §4.1's `Idle -assign-> Busy` edge).
    pub fn reserve(&mut self, required: &HashMap<ResourceKind, f64>) {
        for (kind, amount) in required {
            if let Some(quota) = self.resources.get_mut(kind) {
                quota.available = (quota.available - amount).max(0.0);
            }
        }
        self.task_count += 1;
        self.try_transition(AgentState::Busy);
    }

    /// Releases resources for a resolved task and, once no task remains
    /// outstanding, transitions the agent back to `Idle`.
    pub fn release(&mut self, required: &HashMap<ResourceKind, f64>) {
        for (kind, amount) in required {
            if let Some(quota) = self.resources.get_mut(kind) {
                quota.available = (quota.available + amount).min(quota.total);
            }
        }
        self.task_count = self.task_count.saturating_sub(1);
        if self.task_count == 0 {
            self.try_transition(AgentState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        let mut resources = HashMap::new();
        resources.insert(ResourceKind::Cpu, 4.0);
        resources.insert(ResourceKind::ConcurrentTasks, 8.0);
        Agent::new(AgentId::generate(), "coder", HashSet::new(), resources, false)
    }

    #[test]
    fn idle_to_busy_is_legal() {
        let mut a = agent();
        assert!(a.try_transition(AgentState::Idle));
        assert!(a.try_transition(AgentState::Busy));
        assert_eq!(a.state, AgentState::Busy);
    }

    #[test]
    fn terminated_to_idle_is_illegal() {
        let mut a = agent();
        a.try_transition(AgentState::Idle);
        a.try_transition(AgentState::Terminated);
        assert!(!a.try_transition(AgentState::Idle));
        assert_eq!(a.state, AgentState::Terminated);
    }

    #[test]
    fn reserve_and_release_round_trip_available() {
        let mut a = agent();
        let mut required = HashMap::new();
        required.insert(ResourceKind::Cpu, 1.5);
        a.reserve(&required);
        assert_eq!(a.resources[&ResourceKind::Cpu].available, 2.5);
        a.release(&required);
        assert_eq!(a.resources[&ResourceKind::Cpu].available, 4.0);
    }

    #[test]
    fn performance_score_uses_teacher_formula() {
        let mut m = AgentMetrics::default();
        m.record_completion(500_000_000, true, Utc::now());
        assert!((m.performance_score() - 2.0).abs() < 1e-9);
    }
}
