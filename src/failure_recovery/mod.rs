//! Failure taxonomy, circuit breaking, cascade detection, and recovery.

mod circuit_breaker;
mod manager;
mod taxonomy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use manager::RecoveryManager;
pub use taxonomy::{
    default_strategy, EntityKind, FailureContextFlags, FailureKind, FailureRecord,
    RecoveryStrategy, Severity,
};
