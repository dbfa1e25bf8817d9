//! Crate-wide error taxonomy for the swarm coordinator.
//!
//! Mirrors the structured, per-subsystem error style the teacher codebase
//! uses for `HiveError`: one `thiserror` enum, serializable so it can cross
//! the Control API boundary, with variants grouped by the component that
//! raises them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the coordinator and its subsystems.
///
/// Variant names follow the abstract taxonomy of spec §7 (`ErrNotFound`,
/// `ErrDuplicate`, ...) plus the structural errors the ambient stack needs
/// (configuration, persistence, protocol framing).
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorError {
    /// Named entity does not exist.
    #[error("not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    /// Identity collision on insert.
    #[error("duplicate {entity}: {id}")]
    Duplicate { entity: String, id: String },

    /// Per-swarm agent cap reached.
    #[error("agent capacity reached: {max_agents}")]
    Capacity { max_agents: usize },

    /// No eligible agent exists for a task right now.
    #[error("no eligible agent for task {task_id}")]
    Ineligible { task_id: String },

    /// Worker failed to register before the spawn deadline.
    #[error("agent spawn timed out after {timeout_secs}s")]
    Spawn { timeout_secs: u64 },

    /// Dependency graph on tasks would contain a cycle.
    #[error("dependency cycle detected involving task {task_id}")]
    Cycle { task_id: String },

    /// Malformed worker message.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Message could neither be delivered nor queued.
    #[error("agent {agent_id} unreachable")]
    Unreachable { agent_id: String },

    /// Operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// Circuit breaker rejected the operation.
    #[error("circuit breaker open for {agent_id}")]
    CircuitOpen { agent_id: String },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Persistence store I/O or (de)serialization failure.
    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    /// Invalid input to an otherwise well-formed request.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// Internal invariant violated; indicates a coordinator bug.
    #[error("internal invariant violated: {reason}")]
    Internal { reason: String },
}

/// Convenience alias matching the teacher's `HiveResult<T>`.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl CoordinatorError {
    #[must_use]
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn duplicate(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Duplicate {
            entity: entity.into(),
            id: id.into(),
        }
    }
}
