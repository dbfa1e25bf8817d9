//! Task data model.
//!
//! Generalized from the teacher's `tasks/task.rs` (priority ordering,
//! deadline/duration builder methods, dependency tracking) to the richer
//! state machine and resource-typed requirements the coordinator's
//! orchestrator and load balancer need.

use crate::agent::{AgentId, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Caller-supplied identity, must be unique within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// The aging promotion target, one level up, saturating at `Critical`.
    #[must_use]
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Blocked,
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Blocked, Queued)
                | (Blocked, Cancelled)
                | (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Pending)
                | (Assigned, Failed)
                | (InProgress, Completed)
                | (InProgress, Pending)
                | (InProgress, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    pub execution_time_ns: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub reason: String,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub estimated_duration: Option<Duration>,
    pub timeout: Option<Duration>,
    pub dependencies: HashSet<TaskId>,
    pub required_capabilities: HashSet<String>,
    pub required_resources: HashMap<ResourceKind, f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assignment: Option<TaskAssignment>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    /// When the task most recently entered `Queued`, for aging promotion.
    pub queued_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(
        id: TaskId,
        kind: impl Into<String>,
        description: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: kind.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            estimated_duration: None,
            timeout: None,
            dependencies: HashSet::new(),
            required_capabilities: HashSet::new(),
            required_resources: HashMap::new(),
            retry_count: 0,
            max_retries: 3,
            assignment: None,
            result: None,
            error: None,
            created_at: now,
            queued_at: None,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: HashSet<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn with_required_capabilities(mut self, capabilities: HashSet<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_required_resources(mut self, resources: HashMap<ResourceKind, f64>) -> Self {
        self.required_resources = resources;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn try_transition(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition(next) {
            if next == TaskStatus::Queued {
                self.queued_at = Some(Utc::now());
            }
            self.status = next;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}

/// Ordering for the dispatch loop's priority queue: higher priority first,
/// ties broken by earliest enqueue instant (FIFO within a priority band).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOrder {
    pub priority: TaskPriority,
    pub queued_at: DateTime<Utc>,
}

impl PartialOrd for DispatchOrder {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchOrder {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: TaskPriority) -> Task {
        Task::new(TaskId::from("t1"), "build", "compile the crate", priority)
    }

    #[test]
    fn pending_to_queued_is_legal() {
        let mut t = task(TaskPriority::Medium);
        assert!(t.try_transition(TaskStatus::Queued));
        assert!(t.queued_at.is_some());
    }

    #[test]
    fn completed_is_terminal_and_final() {
        let mut t = task(TaskPriority::Low);
        t.try_transition(TaskStatus::Queued);
        t.try_transition(TaskStatus::Assigned);
        t.try_transition(TaskStatus::InProgress);
        assert!(t.try_transition(TaskStatus::Completed));
        assert!(t.status.is_terminal());
        assert!(!t.try_transition(TaskStatus::Pending));
    }

    #[test]
    fn dispatch_order_prefers_priority_then_fifo() {
        let now = Utc::now();
        let critical = DispatchOrder {
            priority: TaskPriority::Critical,
            queued_at: now,
        };
        let high_earlier = DispatchOrder {
            priority: TaskPriority::High,
            queued_at: now - chrono::Duration::seconds(10),
        };
        assert!(critical > high_earlier);
    }

    #[test]
    fn priority_promotion_saturates_at_critical() {
        assert_eq!(TaskPriority::Critical.promoted(), TaskPriority::Critical);
        assert_eq!(TaskPriority::Low.promoted(), TaskPriority::Medium);
    }

    #[rstest::rstest]
    #[case(TaskStatus::Pending, TaskStatus::Queued, true)]
    #[case(TaskStatus::Pending, TaskStatus::Blocked, true)]
    #[case(TaskStatus::Pending, TaskStatus::InProgress, false)]
    #[case(TaskStatus::Blocked, TaskStatus::Queued, true)]
    #[case(TaskStatus::Blocked, TaskStatus::InProgress, false)]
    #[case(TaskStatus::Queued, TaskStatus::Assigned, true)]
    #[case(TaskStatus::Assigned, TaskStatus::InProgress, true)]
    #[case(TaskStatus::Assigned, TaskStatus::Pending, true)]
    #[case(TaskStatus::InProgress, TaskStatus::Completed, true)]
    #[case(TaskStatus::Completed, TaskStatus::Pending, false)]
    fn can_transition_matches_the_state_table(
        #[case] from: TaskStatus,
        #[case] to: TaskStatus,
        #[case] expected: bool,
    ) {
        assert_eq!(from.can_transition(to), expected);
    }

    proptest::proptest! {
        #[test]
        fn promoted_never_lowers_priority(level in 0u8..4) {
            let priority = match level {
                0 => TaskPriority::Low,
                1 => TaskPriority::Medium,
                2 => TaskPriority::High,
                _ => TaskPriority::Critical,
            };
            proptest::prop_assert!(priority.promoted() as u8 >= priority as u8);
        }
    }
}
