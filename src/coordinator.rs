//! Top-level `Coordinator`: wires the Orchestrator, Load Balancer, Topology
//! Manager, Failure Recovery, and Persistence Store together and runs the
//! background timers of spec §5.
//!
//! Shaped after the teacher's `AppState`/`start_background_tasks` split in
//! `main.rs`/`server.rs`: one shared, `Arc`-wrapped struct, one `tokio::spawn`
//! per timer, all reading/writing through the subsystem's own API rather
//! than reaching into another subsystem's internals.

use crate::agent::{AgentId, AgentState, HealthStatus};
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorResult;
use crate::failure_recovery::{EntityKind, FailureContextFlags, FailureKind, RecoveryManager, Severity};
use crate::load_balancer::{compute_load, LoadBalancer};
use crate::orchestrator::{AgentSpec, MetricsView, Orchestrator, OrchestratorEvent, TaskSpec};
use crate::persistence::{load_checkpoint, save_checkpoint, Checkpoint, MemoryStore, PersistenceStore, SqliteStore};
use crate::server::{ConnectionRegistry, OutboundMessage};
use crate::task::{TaskError, TaskId, TaskResult};
use crate::topology::TopologyManager;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Coordinator {
    config: CoordinatorConfig,
    swarm_id: String,
    orchestrator: Arc<Orchestrator>,
    load_balancer: Arc<LoadBalancer>,
    topology: Arc<TopologyManager>,
    recovery: Arc<RecoveryManager>,
    persistence: Arc<dyn PersistenceStore>,
    connections: Arc<ConnectionRegistry>,
    events: AsyncMutex<Option<tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>>>,
}

impl Coordinator {
    /// Builds the coordinator and, if a checkpoint exists, restores agents
    /// and non-terminal tasks from it before accepting any new work
    /// (spec §7 "Startup" / cold-start fallback).
    pub async fn new(config: CoordinatorConfig) -> CoordinatorResult<Arc<Self>> {
        let (orchestrator, events) = Orchestrator::new(&config.orchestrator);
        let load_balancer = LoadBalancer::new(&config.load_balancer.strategy);
        let topology = TopologyManager::new(&config.topology);
        let recovery = RecoveryManager::new(&config.failure_recovery);
        let persistence: Arc<dyn PersistenceStore> = match &config.persistence.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let connections = ConnectionRegistry::new(config.server.outbound_queue_capacity);

        let coordinator = Arc::new(Self {
            swarm_id: Uuid::new_v4().to_string(),
            orchestrator: Arc::new(orchestrator),
            load_balancer: Arc::new(load_balancer),
            topology: Arc::new(topology),
            recovery: Arc::new(recovery),
            persistence,
            connections: Arc::new(connections),
            events: AsyncMutex::new(Some(events)),
            config,
        });

        coordinator.restore_from_checkpoint().await;
        Ok(coordinator)
    }

    async fn restore_from_checkpoint(&self) {
        let Some(checkpoint) = load_checkpoint(self.persistence.as_ref()).await else {
            info!("no checkpoint found, starting cold");
            return;
        };
        let agent_count = checkpoint.agents.len();
        let task_count = checkpoint.non_terminal_tasks.len();
        for agent in checkpoint.agents {
            let all: Vec<_> = self.orchestrator.agents.all();
            self.topology.add_agent(&agent, &all);
            self.orchestrator.agents.insert(agent);
        }
        for task in checkpoint.non_terminal_tasks {
            self.orchestrator.tasks.insert(task);
        }
        info!(agent_count, task_count, "restored coordinator state from checkpoint");
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    #[must_use]
    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    #[must_use]
    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    #[must_use]
    pub fn register_deadline(&self) -> Duration {
        Duration::from_secs(self.config.server.register_deadline_secs)
    }

    /// `Status()` Control API operation (spec §6.1): the orchestrator's
    /// metrics enriched with load-balancer and topology numbers.
    #[must_use]
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "swarm_id": self.swarm_id,
            "agents": self.orchestrator.list_agents(),
            "tasks": self.orchestrator.list_tasks(),
            "topology": self.topology.metrics(),
            "emergency_stopped": self.recovery.is_emergency_stopped(),
            "accepting_tasks": self.orchestrator.is_accepting_tasks(),
        })
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsView {
        self.orchestrator.metrics()
    }

    /// Debug/dashboard view over the same data `status()` and `metrics()`
    /// expose, for embedders that want a single JSON blob rather than
    /// binding to the typed Control API (SPEC_FULL §B).
    #[must_use]
    pub fn analytics_json(&self) -> serde_json::Value {
        serde_json::json!({
            "swarm_id": self.swarm_id,
            "metrics": self.orchestrator.metrics(),
            "topology": self.topology.metrics(),
            "active_failures": self.recovery.active_records(),
            "emergency_stopped": self.recovery.is_emergency_stopped(),
        })
    }

    /// `SpawnAgent` (spec §4.1/§6.1), additionally registering the agent
    /// with the topology manager under its current pattern.
    pub fn spawn_agent(&self, spec: AgentSpec) -> CoordinatorResult<AgentId> {
        let id = self.orchestrator.spawn_agent(spec)?;
        Ok(id)
    }

    pub fn terminate_agent(&self, id: &AgentId) -> CoordinatorResult<()> {
        self.orchestrator.terminate_agent(id)?;
        let all_agents: Vec<_> = self.orchestrator.agents.all();
        self.topology.remove_agent(id, &all_agents);
        self.recovery.circuit_breakers.remove(id);

        // Deliver the shutdown notification before dropping the agent's
        // outbound queue entirely; a termination is permanent, unlike a
        // plain disconnect, so the queue does not need to survive it.
        let connections = self.connections.clone();
        let id = id.clone();
        tokio::spawn(async move {
            connections.send(&id, OutboundMessage::Shutdown { grace_secs: 0 }).await;
            connections.remove(&id);
        });
        Ok(())
    }

    pub fn submit_task(&self, spec: TaskSpec) -> CoordinatorResult<TaskId> {
        self.orchestrator.submit_task(spec)
    }

    pub fn cancel_task(&self, id: &TaskId) -> CoordinatorResult<()> {
        self.orchestrator.cancel_task(id)
    }

    /// `GetAgent` Control API operation (spec §6.1).
    pub fn get_agent(&self, id: &AgentId) -> CoordinatorResult<crate::orchestrator::AgentView> {
        self.orchestrator.agent_view(id)
    }

    /// `GetTask` Control API operation (spec §6.1).
    pub fn get_task(&self, id: &TaskId) -> CoordinatorResult<crate::orchestrator::TaskView> {
        self.orchestrator.task_view(id)
    }

    /// `ListAgents` Control API operation (spec §6.1).
    #[must_use]
    pub fn list_agents(&self) -> Vec<crate::orchestrator::AgentView> {
        self.orchestrator.list_agents()
    }

    /// `ListTasks` Control API operation (spec §6.1).
    #[must_use]
    pub fn list_tasks(&self) -> Vec<crate::orchestrator::TaskView> {
        self.orchestrator.list_tasks()
    }

    /// `Shutdown(graceDuration)` Control API operation (spec §6.1), callable
    /// directly by an embedder rather than only via the `run` loop's
    /// external shutdown future.
    pub async fn shutdown(&self, grace: Duration) {
        self.orchestrator.stop_accepting_tasks();
        for agent in self.orchestrator.list_agents() {
            self.connections
                .send(
                    &agent.id,
                    OutboundMessage::Shutdown {
                        grace_secs: grace.as_secs(),
                    },
                )
                .await;
        }
        tokio::time::sleep(grace).await;
        self.write_checkpoint().await;
        info!("coordinator shutdown complete (explicit)");
    }

    pub fn record_heartbeat(&self, id: &AgentId, current_load: Option<f64>) {
        self.orchestrator.agents.update(id, |agent| {
            agent.health.last_heartbeat = chrono::Utc::now();
            agent.connected = true;
            if let Some(load) = current_load {
                agent.metrics.current_load = load;
            }
        });
    }

    pub fn record_status(&self, id: &AgentId, health: Option<HealthStatus>, issues: Vec<String>) {
        self.orchestrator.agents.update(id, |agent| {
            if let Some(status) = health {
                agent.health.status = status;
            }
            agent.health.issues = issues;
        });
    }

    pub fn mark_disconnected(&self, id: &AgentId) {
        self.orchestrator.agents.update(id, |agent| {
            agent.connected = false;
        });
    }

    pub fn on_task_result(&self, agent_id: &AgentId, task_id: &TaskId, result: TaskResult) {
        self.orchestrator.complete_task(task_id, result);
        self.recovery.circuit_breakers.record_success(agent_id);
    }

    /// Error handling (spec §4.1 "Error handling"): reports the failure to
    /// the recovery manager, applies the orchestrator's retry/backoff
    /// decision, and checks for a cascade-triggered emergency stop.
    pub async fn on_task_error(&self, agent_id: &AgentId, task_id: &TaskId, error: TaskError) {
        self.recovery.circuit_breakers.record_failure(agent_id);

        let mut context = BTreeMap::new();
        context.insert("task_id".to_string(), task_id.to_string());
        let (_, cascaded) = self.recovery.report(
            FailureKind::TaskError,
            agent_id.to_string(),
            EntityKind::Agent,
            Severity::Medium,
            context,
            FailureContextFlags {
                retryable: error.retryable,
            },
        );
        if cascaded {
            self.emergency_stop().await;
        }

        if let Some((_, Some(delay))) = self.orchestrator.fail_task(task_id, error) {
            let orchestrator = self.orchestrator.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                orchestrator.tasks.update(&task_id, |t| {
                    t.try_transition(crate::task::TaskStatus::Queued);
                });
            });
        }
    }

    /// Stops accepting new tasks and pauses every connected agent
    /// (spec §4.5 cascade response).
    async fn emergency_stop(&self) {
        warn!("emergency stop triggered, pausing swarm");
        self.orchestrator.stop_accepting_tasks();
        for agent in self.orchestrator.list_agents() {
            self.connections.send(&agent.id, OutboundMessage::Pause).await;
        }
    }

    /// Runs every background timer of spec §5 until the shutdown signal
    /// fires, then performs a graceful shutdown.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let mut events_rx = self
            .events
            .lock()
            .await
            .take()
            .expect("events receiver already taken");

        let event_coordinator = self.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                event_coordinator.handle_event(event).await;
            }
        });

        let dispatch_handle = self.clone().spawn_timer(Duration::from_secs(1), |c| c.dispatch_tick());
        let heartbeat_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.orchestrator.heartbeat_scan_secs), |c| {
                c.heartbeat_scan_tick()
            });
        let health_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.orchestrator.health_check_secs), |c| {
                c.health_check_tick()
            });
        let metrics_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.load_balancer.load_recompute_secs), |c| {
                c.metrics_rollup_tick()
            });
        let breaker_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(30), |c| c.circuit_breaker_maintenance_tick());
        let weight_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.load_balancer.weight_recompute_secs), |c| {
                c.weight_recompute_tick()
            });
        let checkpoint_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.orchestrator.checkpoint_interval_secs), |c| {
                c.checkpoint_tick()
            });
        let topology_handle = self
            .clone()
            .spawn_timer(Duration::from_secs(self.config.topology.adaptation_window_secs), |c| {
                c.topology_adaptation_tick()
            });

        shutdown.await;
        info!("shutdown signal received, stopping background timers");

        for handle in [
            dispatch_handle,
            heartbeat_handle,
            health_handle,
            metrics_handle,
            breaker_handle,
            weight_handle,
            checkpoint_handle,
            topology_handle,
        ] {
            handle.abort();
        }
        event_task.abort();

        self.shutdown_gracefully().await;
    }

    /// Spawns a `tokio::time::interval`-driven loop calling `tick` on every
    /// beat, the same shape the teacher's `start_background_tasks` uses for
    /// each of its monitoring loops.
    fn spawn_timer<F, Fut>(self: Arc<Self>, period: Duration, tick: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                tick(self.clone()).await;
            }
        })
    }

    async fn handle_event(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::AgentRegistered(id) => {
                if let Some(agent) = self.orchestrator.agents.get(&id) {
                    let all = self.orchestrator.agents.all();
                    self.topology.add_agent(&agent, &all);
                    let neighbors = self.topology.neighbors(&id);
                    self.connections
                        .send(&id, OutboundMessage::TopologyUpdate { neighbors })
                        .await;
                }
            }
            OrchestratorEvent::AgentTerminated(id) => {
                let all = self.orchestrator.agents.all();
                self.topology.remove_agent(&id, &all);
                self.recovery.circuit_breakers.remove(&id);
            }
            OrchestratorEvent::TaskAssigned(task_id, agent_id) => {
                if let Some(task) = self.orchestrator.tasks.get(&task_id) {
                    let timeout_secs = task
                        .timeout
                        .unwrap_or_else(|| self.orchestrator.default_task_timeout())
                        .as_secs();
                    let peer_agents = self.topology.neighbors(&agent_id);
                    let coordination_endpoint = format!("{}:{}", self.config.server.host, self.config.server.port);
                    self.connections
                        .send(
                            &agent_id,
                            OutboundMessage::TaskAssignment {
                                task_id,
                                kind: task.kind,
                                description: task.description,
                                timeout_secs,
                                peer_agents,
                                coordination_endpoint,
                            },
                        )
                        .await;
                }
            }
            OrchestratorEvent::TaskCompleted(_, _) => {}
            OrchestratorEvent::TaskFailed(_, agent_id) => {
                self.recovery.circuit_breakers.record_failure(&agent_id);
            }
            OrchestratorEvent::AgentUnreachable(agent_id) => {
                self.recovery.circuit_breakers.record_failure(&agent_id);
            }
        }
    }

    async fn dispatch_tick(self: Arc<Self>) {
        if !self.orchestrator.is_accepting_tasks() {
            return;
        }
        let assigned = crate::orchestrator::dispatch_pass(
            &self.orchestrator.agents,
            &self.orchestrator.tasks,
            &self.load_balancer,
            &self.recovery.circuit_breakers,
            self.config.aging_interval(),
            Duration::from_secs(self.config.orchestrator.default_task_timeout_secs),
        );
        for task_id in assigned {
            if let Some(task) = self.orchestrator.tasks.get(&task_id) {
                if let Some(assignment) = &task.assignment {
                    self.orchestrator.mark_assigned(&task_id, &assignment.agent_id);
                }
            }
        }
    }

    /// Fails any agent still `Initializing` past the spawn timeout, and any
    /// agent whose last heartbeat is older than three scan intervals
    /// (spec §4.1 "spawn timeout", §4.5 `AgentUnresponsive`).
    async fn heartbeat_scan_tick(self: Arc<Self>) {
        let now = chrono::Utc::now();
        let spawn_timeout = chrono::Duration::from_std(self.orchestrator.spawn_timeout()).unwrap_or_default();
        let stale_after = chrono::Duration::seconds(self.config.orchestrator.heartbeat_scan_secs as i64 * 3);

        for agent in self.orchestrator.agents.all() {
            if agent.state == AgentState::Initializing
                && now.signed_duration_since(agent.created_at) > spawn_timeout
            {
                self.orchestrator.agents.update(&agent.id, |a| {
                    a.try_transition(AgentState::Failed);
                });
                continue;
            }
            if matches!(agent.state, AgentState::Idle | AgentState::Busy)
                && now.signed_duration_since(agent.health.last_heartbeat) > stale_after
            {
                self.orchestrator.mark_unreachable(&agent.id);
                self.orchestrator.agents.update(&agent.id, |a| {
                    a.health.status = HealthStatus::Unhealthy;
                });
            }
        }
    }

    /// Recomputes each connected agent's health status from its current
    /// error rate and reported issues (spec §4.1 "health").
    async fn health_check_tick(self: Arc<Self>) {
        for agent in self.orchestrator.agents.all() {
            let status = if !agent.health.issues.is_empty() || agent.metrics.error_rate > 0.5 {
                HealthStatus::Unhealthy
            } else if agent.metrics.error_rate > 0.2 {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            };
            self.orchestrator.agents.update(&agent.id, |a| {
                a.health.status = status;
            });
        }
    }

    /// Recomputes each agent's `current_load` from its resource quotas
    /// (spec §4.3 "load").
    async fn metrics_rollup_tick(self: Arc<Self>) {
        for agent in self.orchestrator.agents.all() {
            let load = compute_load(&agent.resources);
            self.orchestrator.agents.update(&agent.id, |a| {
                a.metrics.current_load = load;
            });
        }
    }

    /// No explicit housekeeping beyond the lazy Open->HalfOpen transition
    /// `CircuitBreaker::state` already performs on read; this tick exists to
    /// surface currently-open breakers in the logs (spec §4.5 observability).
    async fn circuit_breaker_maintenance_tick(self: Arc<Self>) {
        let open: Vec<AgentId> = self
            .orchestrator
            .agents
            .all()
            .into_iter()
            .map(|a| a.id)
            .filter(|id| self.recovery.circuit_breakers.is_open(id))
            .collect();
        if !open.is_empty() {
            info!(count = open.len(), "agents with an open circuit breaker");
        }
    }

    async fn weight_recompute_tick(self: Arc<Self>) {
        let agents = self.orchestrator.agents.all();
        self.load_balancer.recompute_weights(&agents);
        for agent in &agents {
            let weight = self.load_balancer.weight_of(&agent.id);
            self.orchestrator.agents.update(&agent.id, |a| {
                a.weight = weight;
            });
        }
    }

    async fn checkpoint_tick(self: Arc<Self>) {
        self.write_checkpoint().await;
    }

    async fn write_checkpoint(&self) {
        let agents = self.orchestrator.agents.all();
        let non_terminal_tasks: Vec<_> = self
            .orchestrator
            .tasks
            .all()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect();
        let topology_graph = agents
            .iter()
            .map(|a| {
                let neighbors = self.topology.neighbors(&a.id).into_iter().map(|n| n.0).collect();
                (a.id.0.clone(), neighbors)
            })
            .collect();

        let checkpoint = Checkpoint {
            swarm_id: self.swarm_id.clone(),
            topology_pattern: self.config.topology.pattern.clone(),
            agents,
            non_terminal_tasks,
            topology_graph,
            metrics: serde_json::to_value(self.metrics()).unwrap_or_default(),
            timestamp: chrono::Utc::now(),
        };
        save_checkpoint(self.persistence.as_ref(), &checkpoint).await;
    }

    async fn topology_adaptation_tick(self: Arc<Self>) {
        let metrics = self.topology.metrics();
        let agents = self.orchestrator.agents.all();
        let projected_score = metrics.density * (1.0 - metrics.centralization).max(0.0);
        self.topology.maybe_adapt(projected_score, &agents);
    }

    /// `Shutdown(graceSecs)` Control API operation (spec §4.1/§6.1): stop
    /// accepting new tasks, let in-flight work finish or time out, write a
    /// final checkpoint, and notify every worker.
    async fn shutdown_gracefully(&self) {
        self.orchestrator.stop_accepting_tasks();
        for agent in self.orchestrator.list_agents() {
            self.connections
                .send(&agent.id, OutboundMessage::Shutdown { grace_secs: 5 })
                .await;
        }
        self.write_checkpoint().await;
        info!("coordinator shutdown complete");
    }
}
