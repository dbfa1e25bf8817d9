//! Per-agent circuit breaker, generalized from the teacher's single global
//! `infrastructure/circuit_breaker.rs` into a registry keyed by `AgentId`.

use crate::agent::AgentId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    threshold: u64,
    timeout: Duration,
    failure_count: AtomicU64,
    state: RwLock<CircuitState>,
    half_open_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u64, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            failure_count: AtomicU64::new(0),
            state: RwLock::new(CircuitState::Closed),
            half_open_at: RwLock::new(None),
        }
    }

    /// Folds the Open->HalfOpen auto-transition into the read, matching
    /// the teacher's `should_attempt_reset` check.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let current = *self.state.read().expect("lock poisoned");
        if current == CircuitState::Open {
            let half_open_at = *self.half_open_at.read().expect("lock poisoned");
            if let Some(at) = half_open_at {
                if Instant::now() >= at {
                    *self.state.write().expect("lock poisoned") = CircuitState::HalfOpen;
                    return CircuitState::HalfOpen;
                }
            }
        }
        current
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn on_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        *self.state.write().expect("lock poisoned") = CircuitState::Closed;
        *self.half_open_at.write().expect("lock poisoned") = None;
    }

    pub fn on_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.open();
            }
            _ => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.threshold {
                    self.open();
                }
            }
        }
    }

    fn open(&self) {
        *self.state.write().expect("lock poisoned") = CircuitState::Open;
        *self.half_open_at.write().expect("lock poisoned") = Some(Instant::now() + self.timeout);
    }
}

/// Registry of per-agent breakers, entries persist until the agent is
/// terminated (spec §3 "Lifetimes").
pub struct CircuitBreakerRegistry {
    threshold: u64,
    timeout: Duration,
    breakers: DashMap<AgentId, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(threshold: u64, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            breakers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_open(&self, agent_id: &AgentId) -> bool {
        self.breakers
            .get(agent_id)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn record_success(&self, agent_id: &AgentId) {
        self.breakers
            .entry(agent_id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.timeout))
            .on_success();
    }

    pub fn record_failure(&self, agent_id: &AgentId) {
        self.breakers
            .entry(agent_id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.timeout))
            .on_failure();
    }

    pub fn remove(&self, agent_id: &AgentId) {
        self.breakers.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_on_success_or_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_tracks_independent_agents() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        let a1 = AgentId::from("a1");
        let a2 = AgentId::from("a2");
        registry.record_failure(&a1);
        assert!(registry.is_open(&a1));
        assert!(!registry.is_open(&a2));
    }
}
