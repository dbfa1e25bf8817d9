//! Orchestrator Core: agent and task lifecycle, the dispatch loop, and the
//! Control API operations of spec §4.1 / §6.1.
//!
//! The registries are the orchestrator's sole mutation surface (spec §5
//! "Shared-resource policy"); every other subsystem reads through the views
//! and events this module publishes rather than touching `AgentRegistry` /
//! `TaskRegistry` directly.

mod dispatch;
mod registry;

pub use dispatch::dispatch_pass;
pub use registry::{AgentRegistry, TaskRegistry};

use crate::agent::{Agent, AgentHealth, AgentId, AgentState, HealthStatus, ResourceKind};
use crate::config::OrchestratorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::{Task, TaskError, TaskId, TaskPriority, TaskResult, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What the caller supplies to `SpawnAgent` (spec §4.1, §6.1).
#[derive(Debug, Clone, Default)]
pub struct AgentSpec {
    pub kind: String,
    pub capabilities: HashSet<String>,
    pub resources: HashMap<ResourceKind, f64>,
}

/// What the caller supplies to `SubmitTask` (spec §3, §6.1).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub kind: String,
    pub description: String,
    pub priority: TaskPriority,
    pub timeout: Option<Duration>,
    pub dependencies: HashSet<TaskId>,
    pub required_capabilities: HashSet<String>,
    pub required_resources: HashMap<ResourceKind, f64>,
    pub max_retries: Option<u32>,
}

/// Read-only projection of an Agent for the Control API (spec §6.1 `AgentView`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentView {
    pub id: AgentId,
    pub kind: String,
    pub state: AgentState,
    pub health: AgentHealth,
    pub task_count: usize,
    pub weight: f64,
    pub success_rate: f64,
    pub current_load: f64,
}

impl From<&Agent> for AgentView {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            kind: agent.kind.clone(),
            state: agent.state,
            health: agent.health.clone(),
            task_count: agent.task_count,
            weight: agent.weight,
            success_rate: agent.metrics.success_rate,
            current_load: agent.metrics.current_load,
        }
    }
}

/// Read-only projection of a Task for the Control API (spec §6.1 `TaskView`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub kind: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub assigned_agent: Option<AgentId>,
    pub retry_count: u32,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind.clone(),
            status: task.status,
            priority: task.priority,
            assigned_agent: task.assignment.as_ref().map(|a| a.agent_id.clone()),
            retry_count: task.retry_count,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }
}

/// `Metrics()` view (spec §6.1), the orchestrator-owned half of it; the
/// Coordinator enriches this with load-balancer/topology/failure numbers.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsView {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub failed_agents: usize,
    pub total_tasks: usize,
    pub queued_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

/// Typed events the orchestrator emits for other subsystems to subscribe to
/// (design notes §9: prefer event-passing over cyclic references).
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    AgentRegistered(AgentId),
    AgentTerminated(AgentId),
    TaskAssigned(TaskId, AgentId),
    TaskCompleted(TaskId, AgentId),
    TaskFailed(TaskId, AgentId),
    AgentUnreachable(AgentId),
}

/// Agent and task registries, lifecycle state machines, and the dispatch
/// loop's supporting operations (spec §4.1).
pub struct Orchestrator {
    pub agents: AgentRegistry,
    pub tasks: TaskRegistry,
    max_agents: usize,
    spawn_timeout: Duration,
    default_task_timeout: Duration,
    default_max_retries: u32,
    base_retry_delay: Duration,
    accepting_tasks: AtomicBool,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: &OrchestratorConfig) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            agents: AgentRegistry::new(),
            tasks: TaskRegistry::new(),
            max_agents: config.max_agents,
            spawn_timeout: Duration::from_secs(config.spawn_timeout_secs),
            default_task_timeout: Duration::from_secs(config.default_task_timeout_secs),
            default_max_retries: config.default_max_retries,
            base_retry_delay: Duration::from_secs(config.base_retry_delay_secs),
            accepting_tasks: AtomicBool::new(true),
            events: tx,
        };
        (orchestrator, rx)
    }

    fn emit(&self, event: OrchestratorEvent) {
        // A closed receiver (coordinator shut down mid-flight) is not an error
        // for the orchestrator to surface; the event simply has no listener.
        let _ = self.events.send(event);
    }

    /// `SpawnAgent(spec) -> AgentId` (spec §4.1). The CORE treats the worker
    /// process itself as out of scope; this creates the placeholder registry
    /// entry in `Initializing` that a subsequent `register` promotes to
    /// `Idle`. The spawn-timeout sweep (run by the coordinator's heartbeat
    /// timer) fails any entry still `Initializing` past `spawn_timeout`.
    pub fn spawn_agent(&self, spec: AgentSpec) -> CoordinatorResult<AgentId> {
        if self.agents.count() >= self.max_agents {
            return Err(CoordinatorError::Capacity {
                max_agents: self.max_agents,
            });
        }
        let id = AgentId::generate();
        let agent = Agent::new(id.clone(), spec.kind, spec.capabilities, spec.resources, false);
        self.agents.insert(agent);
        Ok(id)
    }

    #[must_use]
    pub fn spawn_timeout(&self) -> Duration {
        self.spawn_timeout
    }

    /// Handles an inbound `register` message (spec §4.2). If `id` matches a
    /// pending `SpawnAgent` placeholder, promotes it to `Idle`; otherwise
    /// this is an externally-managed worker joining unprompted, so a fresh
    /// agent is created for it (spec §4.1 "register... still accepted").
    pub fn register(&self, id: AgentId, spec: AgentSpec) {
        let existing = self.agents.contains(&id);
        if existing {
            self.agents.update(&id, |agent| {
                agent.connected = true;
                agent.capabilities = spec.capabilities;
                if !spec.resources.is_empty() {
                    agent.resources = spec
                        .resources
                        .into_iter()
                        .map(|(kind, total)| (kind, crate::agent::ResourceQuota::new(total)))
                        .collect();
                }
                agent.try_transition(AgentState::Idle);
            });
        } else {
            let mut agent = Agent::new(id.clone(), spec.kind, spec.capabilities, spec.resources, true);
            agent.connected = true;
            agent.try_transition(AgentState::Idle);
            self.agents.insert(agent);
        }
        info!(agent_id = %id, "agent registered");
        self.emit(OrchestratorEvent::AgentRegistered(id));
    }

    /// `TerminateAgent(id) -> ok | ErrNotFound` (spec §4.1). Non-terminal
    /// tasks assigned to the agent return to `Pending` for redispatch.
    pub fn terminate_agent(&self, id: &AgentId) -> CoordinatorResult<()> {
        match self.agents.get(id) {
            None => return Err(CoordinatorError::not_found("agent", id.to_string())),
            Some(agent) if agent.state == AgentState::Terminated => {
                return Err(CoordinatorError::not_found("agent", id.to_string()));
            }
            Some(_) => {}
        }
        self.agents.update(id, |agent| {
            agent.try_transition(AgentState::Terminated);
            agent.connected = false;
        });

        for task in self.tasks.all() {
            let assigned_here = task
                .assignment
                .as_ref()
                .map(|a| &a.agent_id == id)
                .unwrap_or(false);
            if assigned_here && !task.status.is_terminal() {
                self.tasks.update(&task.id, |t| {
                    t.assignment = None;
                    t.status = TaskStatus::Pending;
                    t.updated_at = chrono::Utc::now();
                });
            }
        }

        info!(agent_id = %id, "agent terminated");
        self.emit(OrchestratorEvent::AgentTerminated(id.clone()));
        Ok(())
    }

    /// Destroys the registry entry once the agent is `Terminated` and every
    /// task it ever held is resolved (spec §3 "Ownership").
    pub fn reap_terminated_agent(&self, id: &AgentId) -> bool {
        let Some(agent) = self.agents.get(id) else {
            return false;
        };
        if agent.state != AgentState::Terminated {
            return false;
        }
        let still_held = self.tasks.all().iter().any(|t| {
            t.assignment
                .as_ref()
                .map(|a| &a.agent_id == id)
                .unwrap_or(false)
                && !t.status.is_terminal()
        });
        if still_held {
            return false;
        }
        self.agents.remove(id);
        true
    }

    /// `SubmitTask(spec) -> TaskId | ErrDuplicate | ErrCycle` (spec §4.1).
    pub fn submit_task(&self, spec: TaskSpec) -> CoordinatorResult<TaskId> {
        if self.tasks.get(&spec.id).is_some() {
            return Err(CoordinatorError::duplicate("task", spec.id.to_string()));
        }
        self.check_acyclic(&spec.id, &spec.dependencies)?;

        let mut task = Task::new(spec.id.clone(), spec.kind, spec.description, spec.priority)
            .with_dependencies(spec.dependencies.clone())
            .with_required_capabilities(spec.required_capabilities)
            .with_required_resources(spec.required_resources)
            .with_max_retries(spec.max_retries.unwrap_or(self.default_max_retries));
        if let Some(timeout) = spec.timeout {
            task = task.with_timeout(timeout);
        }

        let deps_met = spec
            .dependencies
            .iter()
            .all(|dep| self.tasks.get(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false));

        if deps_met {
            task.try_transition(TaskStatus::Queued);
        } else {
            task.try_transition(TaskStatus::Blocked);
        }

        let id = task.id.clone();
        self.tasks.insert(task);
        Ok(id)
    }

    /// DFS cycle check over the dependency graph including the not-yet-
    /// inserted candidate task (spec §3 "Dependency graph... acyclic").
    fn check_acyclic(&self, new_id: &TaskId, new_deps: &HashSet<TaskId>) -> CoordinatorResult<()> {
        let mut visiting = HashSet::new();
        let mut stack = vec![new_id.clone()];
        // walk dependencies transitively; if we ever reach `new_id` again,
        // there is a cycle through the edge we are about to add.
        let mut frontier: Vec<TaskId> = new_deps.iter().cloned().collect();
        visiting.insert(new_id.clone());
        while let Some(dep) = frontier.pop() {
            if dep == *new_id {
                return Err(CoordinatorError::Cycle {
                    task_id: new_id.to_string(),
                });
            }
            if !visiting.insert(dep.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(&dep) {
                frontier.extend(task.dependencies.iter().cloned());
            }
        }
        let _ = stack.pop();
        Ok(())
    }

    /// `Status(taskId) -> TaskView | ErrNotFound` (spec §6.1).
    pub fn task_view(&self, id: &TaskId) -> CoordinatorResult<TaskView> {
        self.tasks
            .get(id)
            .map(|t| TaskView::from(&t))
            .ok_or_else(|| CoordinatorError::not_found("task", id.to_string()))
    }

    pub fn agent_view(&self, id: &AgentId) -> CoordinatorResult<AgentView> {
        self.agents
            .get(id)
            .map(|a| AgentView::from(&a))
            .ok_or_else(|| CoordinatorError::not_found("agent", id.to_string()))
    }

    #[must_use]
    pub fn list_agents(&self) -> Vec<AgentView> {
        self.agents.all().iter().map(AgentView::from).collect()
    }

    #[must_use]
    pub fn list_tasks(&self) -> Vec<TaskView> {
        self.tasks.all().iter().map(TaskView::from).collect()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsView {
        let agents = self.agents.all();
        let tasks = self.tasks.all();
        MetricsView {
            total_agents: agents.len(),
            idle_agents: agents.iter().filter(|a| a.state == AgentState::Idle).count(),
            busy_agents: agents.iter().filter(|a| a.state == AgentState::Busy).count(),
            failed_agents: agents.iter().filter(|a| a.state == AgentState::Failed).count(),
            total_tasks: tasks.len(),
            queued_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Queued).count(),
            in_progress_tasks: tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count(),
            completed_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Completed).count(),
            failed_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
        }
    }

    /// `CancelTask(taskId) -> ok` (spec §5 "Cancellation"). Legal from any
    /// non-terminal state; the spec's state diagram only lists a few
    /// explicit `-cancel->` edges, but §5 and §8 both require cancellation
    /// to be universally available pre-terminal, so this bypasses
    /// `can_transition` for that one purpose.
    pub fn cancel_task(&self, id: &TaskId) -> CoordinatorResult<()> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| CoordinatorError::not_found("task", id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if let Some(assignment) = &task.assignment {
            self.agents.update(&assignment.agent_id, |a| {
                a.release(&task.required_resources);
            });
        }
        self.tasks.update(id, |t| {
            t.assignment = None;
            t.status = TaskStatus::Cancelled;
            t.updated_at = chrono::Utc::now();
        });
        Ok(())
    }

    /// Marks an `Assigned` task as having started execution (the worker
    /// acknowledged the assignment).
    pub fn start_task(&self, id: &TaskId) -> bool {
        self.tasks.update(id, |t| {
            t.try_transition(TaskStatus::InProgress);
        })
    }

    /// Result handling (spec §4.1 "Result handling"): completes the task,
    /// releases the agent's resources, and promotes any task that was
    /// `Blocked` solely on this one.
    pub fn complete_task(&self, id: &TaskId, result: TaskResult) -> Option<AgentId> {
        let task = self.tasks.get(id)?;
        let agent_id = task.assignment.as_ref().map(|a| a.agent_id.clone())?;

        self.tasks.update(id, |t| {
            t.result = Some(result.clone());
            t.try_transition(TaskStatus::Completed);
        });
        self.agents.update(&agent_id, |agent| {
            // `release` transitions Busy -> Idle itself once no task remains
            // outstanding on this agent (spec §4.1's `complete -> Idle` edge
            // only applies once the agent is fully drained).
            agent.release(&task.required_resources);
            agent.metrics.record_completion(result.execution_time_ns, true, result.completed_at);
        });

        self.promote_blocked_on(id);
        self.emit(OrchestratorEvent::TaskCompleted(id.clone(), agent_id.clone()));
        Some(agent_id)
    }

    fn promote_blocked_on(&self, completed: &TaskId) {
        for blocked_id in self.tasks.blocked_on(completed) {
            let Some(blocked) = self.tasks.get(&blocked_id) else {
                continue;
            };
            let deps_met = blocked
                .dependencies
                .iter()
                .all(|dep| self.tasks.get(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false));
            if deps_met {
                self.tasks.update(&blocked_id, |t| {
                    t.try_transition(TaskStatus::Queued);
                });
            }
        }
    }

    /// Error handling (spec §4.1 "Error handling"). Returns the backoff
    /// delay the caller should wait before the task becomes selectable
    /// again, or `None` when the task reached a terminal `Failed`.
    pub fn fail_task(&self, id: &TaskId, error: TaskError) -> Option<(AgentId, Option<Duration>)> {
        let task = self.tasks.get(id)?;
        let agent_id = task.assignment.as_ref().map(|a| a.agent_id.clone())?;

        self.agents.update(&agent_id, |agent| {
            agent.release(&task.required_resources);
            agent.metrics.record_completion(0, false, error.failed_at);
        });

        let retryable = error.retryable && task.retry_count < task.max_retries;
        if retryable {
            let attempts = task.retry_count;
            self.tasks.update(id, |t| {
                t.retry_count += 1;
                t.assignment = None;
                t.error = Some(error);
                t.try_transition(TaskStatus::Pending);
            });
            let delay = self.base_retry_delay * 2u32.saturating_pow(attempts);
            Some((agent_id, Some(delay)))
        } else {
            self.tasks.update(id, |t| {
                t.retry_count += 1;
                t.error = Some(error);
                t.try_transition(TaskStatus::Failed);
            });
            self.emit(OrchestratorEvent::TaskFailed(id.clone(), agent_id.clone()));
            Some((agent_id, None))
        }
    }

    /// Handles a spawn/assignment timeout: fails the task (subject to the
    /// same retry policy as any other error) per spec §4.1's
    /// "Assigned/InProgress -timeout-> Failed" edge.
    pub fn timeout_task(&self, id: &TaskId) -> Option<(AgentId, Option<Duration>)> {
        self.fail_task(
            id,
            TaskError {
                reason: "assignment timed out".to_string(),
                retryable: true,
                failed_at: chrono::Utc::now(),
            },
        )
    }

    #[must_use]
    pub fn default_task_timeout(&self) -> Duration {
        self.default_task_timeout
    }

    pub fn stop_accepting_tasks(&self) {
        self.accepting_tasks.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting_tasks(&self) {
        self.accepting_tasks.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_accepting_tasks(&self) -> bool {
        self.accepting_tasks.load(Ordering::SeqCst)
    }

    pub fn mark_unreachable(&self, id: &AgentId) {
        self.emit(OrchestratorEvent::AgentUnreachable(id.clone()));
    }

    pub fn mark_assigned(&self, task_id: &TaskId, agent_id: &AgentId) {
        self.emit(OrchestratorEvent::TaskAssigned(task_id.clone(), agent_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_agents: 2,
            spawn_timeout_secs: 30,
            aging_interval_secs: 60,
            base_retry_delay_secs: 5,
            default_max_retries: 3,
            default_task_timeout_secs: 300,
            heartbeat_scan_secs: 5,
            health_check_secs: 10,
            checkpoint_interval_secs: 60,
        }
    }

    #[test]
    fn spawn_beyond_capacity_fails() {
        let (orch, _rx) = Orchestrator::new(&config());
        orch.spawn_agent(AgentSpec::default()).unwrap();
        orch.spawn_agent(AgentSpec::default()).unwrap();
        let err = orch.spawn_agent(AgentSpec::default()).unwrap_err();
        assert!(matches!(err, CoordinatorError::Capacity { max_agents: 2 }));
    }

    #[test]
    fn submit_duplicate_task_id_is_rejected() {
        let (orch, _rx) = Orchestrator::new(&config());
        let spec = |id: &str| TaskSpec {
            id: TaskId::from(id),
            kind: "build".into(),
            description: "x".into(),
            priority: TaskPriority::Medium,
            timeout: None,
            dependencies: HashSet::new(),
            required_capabilities: HashSet::new(),
            required_resources: Map::new(),
            max_retries: None,
        };
        orch.submit_task(spec("t1")).unwrap();
        let err = orch.submit_task(spec("t1")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Duplicate { .. }));
    }

    #[test]
    fn submit_with_cycle_is_rejected() {
        let (orch, _rx) = Orchestrator::new(&config());
        let mut deps1 = HashSet::new();
        deps1.insert(TaskId::from("t2"));
        orch.submit_task(TaskSpec {
            id: TaskId::from("t1"),
            kind: "build".into(),
            description: "x".into(),
            priority: TaskPriority::Medium,
            timeout: None,
            dependencies: deps1,
            required_capabilities: HashSet::new(),
            required_resources: Map::new(),
            max_retries: None,
        })
        .unwrap();

        let mut deps2 = HashSet::new();
        deps2.insert(TaskId::from("t1"));
        let err = orch
            .submit_task(TaskSpec {
                id: TaskId::from("t2"),
                kind: "build".into(),
                description: "x".into(),
                priority: TaskPriority::Medium,
                timeout: None,
                dependencies: deps2,
                required_capabilities: HashSet::new(),
                required_resources: Map::new(),
                max_retries: None,
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Cycle { .. }));
    }

    #[test]
    fn task_with_unmet_dependency_is_blocked() {
        let (orch, _rx) = Orchestrator::new(&config());
        let mut deps = HashSet::new();
        deps.insert(TaskId::from("missing"));
        orch.submit_task(TaskSpec {
            id: TaskId::from("t1"),
            kind: "build".into(),
            description: "x".into(),
            priority: TaskPriority::Medium,
            timeout: None,
            dependencies: deps,
            required_capabilities: HashSet::new(),
            required_resources: Map::new(),
            max_retries: None,
        })
        .unwrap();
        let view = orch.task_view(&TaskId::from("t1")).unwrap();
        assert_eq!(view.status, TaskStatus::Blocked);
    }

    #[test]
    fn terminate_unknown_agent_is_not_found() {
        let (orch, _rx) = Orchestrator::new(&config());
        let err = orch.terminate_agent(&AgentId::from("ghost")).unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound { .. }));
    }

    #[test]
    fn terminate_twice_is_not_found_second_time() {
        let (orch, _rx) = Orchestrator::new(&config());
        let id = orch.spawn_agent(AgentSpec::default()).unwrap();
        orch.terminate_agent(&id).unwrap();
        let err = orch.terminate_agent(&id).unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound { .. }));
    }

    #[test]
    fn cancel_task_always_reaches_cancelled() {
        let (orch, _rx) = Orchestrator::new(&config());
        orch.submit_task(TaskSpec {
            id: TaskId::from("t1"),
            kind: "build".into(),
            description: "x".into(),
            priority: TaskPriority::Medium,
            timeout: None,
            dependencies: HashSet::new(),
            required_capabilities: HashSet::new(),
            required_resources: Map::new(),
            max_retries: None,
        })
        .unwrap();
        orch.cancel_task(&TaskId::from("t1")).unwrap();
        assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().status, TaskStatus::Cancelled);
    }
}
