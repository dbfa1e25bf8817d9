//! Dispatch loop: scans `Queued` tasks in priority order and assigns them
//! via the Load Balancer (spec §4.1 "Dispatch loop").

use super::registry::{AgentRegistry, TaskRegistry};
use crate::agent::AgentId;
use crate::failure_recovery::CircuitBreakerRegistry;
use crate::load_balancer::LoadBalancer;
use crate::task::{TaskAssignment, TaskStatus};
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// Runs a single dispatch pass: ages stale `Queued` tasks, then attempts to
/// assign each in priority order. Returns the ids successfully assigned.
pub fn dispatch_pass(
    agent_registry: &AgentRegistry,
    task_registry: &TaskRegistry,
    load_balancer: &LoadBalancer,
    circuit_breakers: &CircuitBreakerRegistry,
    aging_interval: Duration,
    default_timeout: Duration,
) -> Vec<crate::task::TaskId> {
    apply_aging(task_registry, aging_interval);

    // A mutable local copy of agent state, kept in sync with every reservation
    // made during this pass. Selecting from the registry's live state instead
    // would require re-fetching on every iteration; selecting from a single
    // snapshot taken once would let the same agent be picked past its
    // concurrency limit, since the snapshot never reflects reservations this
    // same pass already made (spec §4.3 eligibility rule (e)).
    let mut agents = agent_registry.all();
    let mut assigned = Vec::new();

    for task in task_registry.queued_by_priority() {
        let exclude: HashSet<AgentId> = HashSet::new();
        let Some(agent_id) = load_balancer.select(&task, &exclude, &agents, circuit_breakers)
        else {
            continue;
        };

        let timeout = task.timeout.unwrap_or(default_timeout);
        let assigned_ok = task_registry.update(&task.id, |t| {
            if t.try_transition(TaskStatus::Assigned) {
                t.assignment = Some(TaskAssignment {
                    agent_id: agent_id.clone(),
                    assigned_at: Utc::now(),
                    timeout,
                });
            }
        });

        if assigned_ok {
            agent_registry.update(&agent_id, |a| {
                a.reserve(&task.required_resources);
            });
            if let Some(local) = agents.iter_mut().find(|a| a.id == agent_id) {
                local.reserve(&task.required_resources);
            }
            info!(task_id = %task.id, agent_id = %agent_id, "task assigned");
            assigned.push(task.id.clone());
        }
    }

    assigned
}

/// Promotes any `Queued` task that has waited longer than `aging_interval`
/// one priority level, bounding starvation (spec §4.1).
fn apply_aging(task_registry: &TaskRegistry, aging_interval: Duration) {
    let now = Utc::now();
    let aging = chrono::Duration::from_std(aging_interval).unwrap_or_default();

    for task in task_registry.queued_by_priority() {
        let Some(queued_at) = task.queued_at else {
            continue;
        };
        if now.signed_duration_since(queued_at) > aging {
            let promoted = task.priority.promoted();
            if promoted != task.priority {
                task_registry.update(&task.id, |t| {
                    t.priority = promoted;
                    // Reset the aging clock so the task gains at most one
                    // priority level per `aging_interval`, rather than
                    // climbing every dispatch pass while it waits.
                    t.queued_at = Some(now);
                    warn!(task_id = %t.id, ?promoted, "task priority aged up");
                });
            }
        }
    }
}
