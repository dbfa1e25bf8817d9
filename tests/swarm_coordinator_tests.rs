//! End-to-end scenarios over the public orchestrator/load-balancer/topology/
//! recovery API, exercising the dispatch loop the way the coordinator's
//! background timer drives it in production.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use pretty_assertions::assert_eq;
use swarm_coordinator::agent::{Agent, AgentId, AgentState, ResourceKind};
use swarm_coordinator::config::{FailureRecoveryConfig, OrchestratorConfig, TopologyConfig};
use swarm_coordinator::failure_recovery::{
    CircuitBreakerRegistry, EntityKind, FailureContextFlags, FailureKind, RecoveryManager, Severity,
};
use swarm_coordinator::load_balancer::LoadBalancer;
use swarm_coordinator::orchestrator::{dispatch_pass, Orchestrator, TaskSpec};
use swarm_coordinator::task::{TaskError, TaskId, TaskPriority, TaskResult, TaskStatus};
use swarm_coordinator::topology::{TopologyManager, TopologyPattern};

fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_agents: 64,
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

fn failure_recovery_config() -> FailureRecoveryConfig {
    FailureRecoveryConfig {
        circuit_breaker_threshold: 5,
        circuit_breaker_timeout_secs: 60,
        cascade_window_secs: 30,
        cascade_threshold: 3,
        max_recovery_attempts: 3,
        pattern_match_threshold: 3,
    }
}

fn circuit_breakers() -> CircuitBreakerRegistry {
    let cfg = failure_recovery_config();
    CircuitBreakerRegistry::new(cfg.circuit_breaker_threshold, Duration::from_secs(cfg.circuit_breaker_timeout_secs))
}

fn idle_agent(id: &str, concurrent_tasks: f64) -> Agent {
    let mut resources = HashMap::new();
    resources.insert(ResourceKind::ConcurrentTasks, concurrent_tasks);
    let mut agent = Agent::new(AgentId::from(id), "worker", HashSet::new(), resources, false);
    agent.state = AgentState::Idle;
    agent
}

fn task_spec(id: &str, priority: TaskPriority, dependencies: HashSet<TaskId>) -> TaskSpec {
    TaskSpec {
        id: TaskId::from(id),
        kind: "build".into(),
        description: "compile the crate".into(),
        priority,
        timeout: None,
        dependencies,
        required_capabilities: HashSet::new(),
        required_resources: HashMap::new(),
        max_retries: None,
    }
}

/// Three agents, each allowing two concurrent tasks, fan out over seven
/// tasks: the first pass assigns six (two per agent) and leaves one queued;
/// completing one task frees a slot for the seventh.
#[test]
fn fan_out_across_three_agents_respects_concurrency_limit() {
    let (orch, _events) = Orchestrator::new(&orchestrator_config());
    for name in ["a1", "a2", "a3"] {
        orch.agents.insert(idle_agent(name, 2.0));
    }
    for i in 1..=7 {
        let id = format!("t{i}");
        orch.submit_task(task_spec(&id, TaskPriority::Medium, HashSet::new())).unwrap();
    }

    let load_balancer = LoadBalancer::new(&swarm_coordinator::config::LoadBalancerStrategyConfig::LeastLoaded);
    let breakers = circuit_breakers();

    let assigned = dispatch_pass(
        &orch.agents,
        &orch.tasks,
        &load_balancer,
        &breakers,
        Duration::from_secs(60),
        Duration::from_secs(300),
    );
    assert_eq!(assigned.len(), 6, "only six of seven tasks fit under the concurrency cap");

    for agent in orch.agents.all() {
        assert_eq!(agent.task_count, 2, "every agent should be saturated at its limit");
    }

    let still_queued: Vec<_> = orch
        .tasks
        .all()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Queued)
        .collect();
    assert_eq!(still_queued.len(), 1);

    // Complete one assigned task, freeing a slot for the seventh.
    let completed_id = orch
        .tasks
        .all()
        .into_iter()
        .find(|t| t.status == TaskStatus::Assigned)
        .unwrap()
        .id;
    orch.complete_task(
        &completed_id,
        TaskResult {
            output: "ok".into(),
            execution_time_ns: 10_000_000,
            completed_at: chrono::Utc::now(),
        },
    );

    let assigned_again = dispatch_pass(
        &orch.agents,
        &orch.tasks,
        &load_balancer,
        &breakers,
        Duration::from_secs(60),
        Duration::from_secs(300),
    );
    assert_eq!(assigned_again.len(), 1, "the freed slot lets the seventh task dispatch");
}

/// T1 -> T2 -> T3 dependency chain: each stays `Blocked` until its
/// predecessor completes, then dispatches in order on a single agent.
#[test]
fn dependency_chain_dispatches_in_order() {
    let (orch, _events) = Orchestrator::new(&orchestrator_config());
    orch.agents.insert(idle_agent("a1", 5.0));

    orch.submit_task(task_spec("t1", TaskPriority::High, HashSet::new())).unwrap();
    orch.submit_task(task_spec("t2", TaskPriority::High, HashSet::from([TaskId::from("t1")])))
        .unwrap();
    orch.submit_task(task_spec("t3", TaskPriority::High, HashSet::from([TaskId::from("t2")])))
        .unwrap();

    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().status, TaskStatus::Queued);
    assert_eq!(orch.task_view(&TaskId::from("t2")).unwrap().status, TaskStatus::Blocked);
    assert_eq!(orch.task_view(&TaskId::from("t3")).unwrap().status, TaskStatus::Blocked);

    let load_balancer = LoadBalancer::new(&swarm_coordinator::config::LoadBalancerStrategyConfig::LeastLoaded);
    let breakers = circuit_breakers();
    let dispatch = || {
        dispatch_pass(
            &orch.agents,
            &orch.tasks,
            &load_balancer,
            &breakers,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    };
    let complete = |id: &str| {
        orch.complete_task(
            &TaskId::from(id),
            TaskResult {
                output: "ok".into(),
                execution_time_ns: 1_000_000,
                completed_at: chrono::Utc::now(),
            },
        )
    };

    assert_eq!(dispatch(), vec![TaskId::from("t1")]);
    complete("t1");
    assert_eq!(orch.task_view(&TaskId::from("t2")).unwrap().status, TaskStatus::Queued);

    assert_eq!(dispatch(), vec![TaskId::from("t2")]);
    complete("t2");
    assert_eq!(orch.task_view(&TaskId::from("t3")).unwrap().status, TaskStatus::Queued);

    assert_eq!(dispatch(), vec![TaskId::from("t3")]);
    complete("t3");
    assert_eq!(orch.task_view(&TaskId::from("t3")).unwrap().status, TaskStatus::Completed);
}

/// A task left `Queued` past the aging interval is promoted exactly one
/// priority level, not re-promoted on every subsequent dispatch pass until
/// another full interval has elapsed, without requiring an eligible agent
/// to exist.
#[test]
fn priority_ages_up_once_per_interval() {
    let (orch, _events) = Orchestrator::new(&orchestrator_config());
    orch.submit_task(task_spec("t1", TaskPriority::Low, HashSet::new())).unwrap();

    orch.tasks.update(&TaskId::from("t1"), |t| {
        t.queued_at = Some(chrono::Utc::now() - chrono::Duration::seconds(61));
    });

    let load_balancer = LoadBalancer::new(&swarm_coordinator::config::LoadBalancerStrategyConfig::LeastLoaded);
    let breakers = circuit_breakers();
    let dispatch = || {
        dispatch_pass(&orch.agents, &orch.tasks, &load_balancer, &breakers, Duration::from_secs(60), Duration::from_secs(300))
    };

    dispatch();
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().priority, TaskPriority::Medium);

    // A second pass run immediately after must not promote again: the aging
    // clock was reset by the first promotion, so less than one interval has
    // elapsed since.
    dispatch();
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().priority, TaskPriority::Medium);

    // Only once another full interval has passed does the task age up again.
    orch.tasks.update(&TaskId::from("t1"), |t| {
        t.queued_at = Some(chrono::Utc::now() - chrono::Duration::seconds(61));
    });
    dispatch();
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().priority, TaskPriority::High);

    // With no agents present the task is never eligible for assignment, so
    // it stays in `Queued` throughout, confirming aging runs independently
    // of dispatch outcome.
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().status, TaskStatus::Queued);
}

/// A retryable error requeues the task with doubling backoff until
/// `max_retries` is exhausted, at which point it reaches `Failed` (spec §8
/// scenario 4: `maxRetries=2`, two `Pending` round-trips, failed on the
/// third attempt with `attempts=3`).
#[test]
fn retryable_error_backs_off_then_fails_after_max_retries() {
    let (orch, _events) = Orchestrator::new(&orchestrator_config());
    orch.agents.insert(idle_agent("a1", 1.0));
    orch.submit_task(TaskSpec {
        max_retries: Some(2),
        ..task_spec("t1", TaskPriority::Medium, HashSet::new())
    })
    .unwrap();

    let load_balancer = LoadBalancer::new(&swarm_coordinator::config::LoadBalancerStrategyConfig::LeastLoaded);
    let breakers = circuit_breakers();
    let dispatch = || {
        dispatch_pass(
            &orch.agents,
            &orch.tasks,
            &load_balancer,
            &breakers,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    };
    let fail = |attempt: u32| {
        orch.fail_task(
            &TaskId::from("t1"),
            TaskError {
                reason: "worker unreachable".into(),
                retryable: true,
                failed_at: chrono::Utc::now(),
            },
        )
        .map(|(agent, delay)| {
            // sanity: backoff doubles with each attempt per spec's formula.
            if let Some(delay) = delay {
                assert_eq!(delay, Duration::from_secs(5) * 2u32.pow(attempt));
            }
            agent
        })
    };

    assert_eq!(dispatch(), vec![TaskId::from("t1")]);
    fail(0);
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().status, TaskStatus::Pending);
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().retry_count, 1);
    orch.tasks.update(&TaskId::from("t1"), |t| {
        t.try_transition(TaskStatus::Queued);
    });

    assert_eq!(dispatch(), vec![TaskId::from("t1")]);
    fail(1);
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().status, TaskStatus::Pending);
    assert_eq!(orch.task_view(&TaskId::from("t1")).unwrap().retry_count, 2);
    orch.tasks.update(&TaskId::from("t1"), |t| {
        t.try_transition(TaskStatus::Queued);
    });

    assert_eq!(dispatch(), vec![TaskId::from("t1")]);
    let (_, delay) = orch
        .fail_task(
            &TaskId::from("t1"),
            TaskError {
                reason: "worker unreachable".into(),
                retryable: true,
                failed_at: chrono::Utc::now(),
            },
        )
        .unwrap();
    assert!(delay.is_none(), "retries are exhausted, no further backoff is scheduled");
    let view = orch.task_view(&TaskId::from("t1")).unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.retry_count, 3);
}

/// Three distinct agent-crash failures inside the cascade window trip
/// `EmergencyStop`; task submission still succeeds but nothing dispatches
/// while the swarm is paused.
#[test]
fn three_agent_crashes_trigger_cascade_and_pauses_dispatch() {
    let recovery = RecoveryManager::new(&failure_recovery_config());
    let (orch, _events) = Orchestrator::new(&orchestrator_config());
    orch.agents.insert(idle_agent("a1", 4.0));

    let mut cascaded = false;
    for agent in ["a1", "a2", "a3"] {
        let (_, this_cascaded) = recovery.report(
            FailureKind::AgentCrash,
            agent,
            EntityKind::Agent,
            Severity::High,
            std::collections::BTreeMap::new(),
            FailureContextFlags { retryable: false },
        );
        cascaded = cascaded || this_cascaded;
    }
    assert!(cascaded);
    assert!(recovery.is_emergency_stopped());

    orch.stop_accepting_tasks();
    let id = orch.submit_task(task_spec("t1", TaskPriority::Medium, HashSet::new())).unwrap();
    assert_eq!(orch.task_view(&id).unwrap().status, TaskStatus::Queued);

    // The coordinator's dispatch tick checks `is_accepting_tasks` before
    // ever calling `dispatch_pass`; mirror that guard here.
    assert!(!orch.is_accepting_tasks());
}

/// Removing the hub of a star topology leaves no isolated vertex: the
/// repair invariant reconnects every orphaned spoke.
#[test]
fn topology_repairs_after_removing_star_hub() {
    let config = TopologyConfig {
        pattern: "star".to_string(),
        adaptation_enabled: false,
        adaptation_window_secs: 300,
        adaptation_threshold: 0.15,
        max_adaptations_per_hour: 3,
    };
    let manager = TopologyManager::new(&config);

    // Star insertion always attaches the new agent to the existing agent
    // with the highest degree; once the first spoke connects to the hub,
    // the hub strictly outranks every other spoke (degree n-1 vs 1), so
    // every later insert deterministically lands on the same hub.
    let hub = idle_agent("hub", 4.0);
    let spoke1 = idle_agent("spoke1", 4.0);
    let spoke2 = idle_agent("spoke2", 4.0);
    let spoke3 = idle_agent("spoke3", 4.0);
    let all = vec![hub.clone(), spoke1.clone(), spoke2.clone(), spoke3.clone()];

    manager.add_agent(&hub, &all);
    manager.add_agent(&spoke1, &all);
    manager.add_agent(&spoke2, &all);
    manager.add_agent(&spoke3, &all);

    for spoke in [&spoke1, &spoke2, &spoke3] {
        assert_eq!(manager.neighbors(&spoke.id), vec![hub.id.clone()]);
    }

    manager.remove_agent(&hub.id, &[spoke1.clone(), spoke2.clone(), spoke3.clone()]);

    for spoke in [&spoke1, &spoke2, &spoke3] {
        assert!(
            !manager.neighbors(&spoke.id).is_empty(),
            "every spoke must be reconnected once the hub is removed"
        );
    }
}

#[test]
fn hierarchical_pattern_is_named_correctly() {
    assert_eq!(TopologyPattern::parse("hierarchical"), TopologyPattern::Hierarchical);
}
