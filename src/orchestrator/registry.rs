//! Agent and task registries, the orchestrator's sole mutation surface
//! (spec §5 "Shared-resource policy").
//!
//! DashMap-based concurrent storage, grounded in the teacher's
//! `core/hive/agent_management/registry.rs::AgentRegistry`.

use crate::agent::{Agent, AgentId};
use crate::task::{Task, TaskId};
use dashmap::DashMap;

#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Agent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn remove(&self, id: &AgentId) -> Option<Agent> {
        self.agents.remove(id).map(|(_, agent)| agent)
    }

    #[must_use]
    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.get(id).map(|a| a.clone())
    }

    pub fn update<F: FnOnce(&mut Agent)>(&self, id: &AgentId, f: F) -> bool {
        if let Some(mut agent) = self.agents.get_mut(id) {
            f(&mut agent);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn all(&self) -> Vec<Agent> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id.clone(), task);
        true
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn update<F: FnOnce(&mut Task)>(&self, id: &TaskId, f: F) -> bool {
        if let Some(mut task) = self.tasks.get_mut(id) {
            f(&mut task);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn all(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| t.clone()).collect()
    }

    #[must_use]
    pub fn queued_by_priority(&self) -> Vec<Task> {
        use crate::task::TaskStatus;
        let mut queued: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| t.clone())
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
        });
        queued
    }

    #[must_use]
    pub fn blocked_on(&self, completed: &TaskId) -> Vec<TaskId> {
        use crate::task::TaskStatus;
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked && t.dependencies.contains(completed))
            .map(|t| t.id.clone())
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}
