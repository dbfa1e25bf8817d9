//! Recovery loop, cascade detection, and pattern recognition (spec §4.5).
//!
//! The attempt-then-escalate shape is grounded in the teacher's
//! `agents/recovery.rs` (`recover_agent` → `attempt_recovery` → fallback to
//! `emergency_reset`), generalized from a single agent-recovery manager into
//! a failure-kind-agnostic recovery manager that also runs cascade and
//! pattern detection.

use super::circuit_breaker::CircuitBreakerRegistry;
use super::taxonomy::{
    default_strategy, escalate_strategy, EntityKind, FailureContextFlags, FailureKind,
    FailureRecord, FailureStatus, RecoveryStrategy, Severity,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, warn};

pub struct RecoveryManager {
    pub circuit_breakers: CircuitBreakerRegistry,
    records: RwLock<Vec<FailureRecord>>,
    recent_failures: RwLock<VecDeque<chrono::DateTime<chrono::Utc>>>,
    pattern_counts: RwLock<HashMap<String, u32>>,
    pattern_overrides: RwLock<HashMap<String, RecoveryStrategy>>,
    cascade_window: Duration,
    cascade_threshold: usize,
    pattern_match_threshold: u32,
    max_attempts: u32,
    base_backoff: Duration,
    emergency_stop: AtomicBool,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(config: &crate::config::FailureRecoveryConfig) -> Self {
        Self {
            circuit_breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker_threshold,
                Duration::from_secs(config.circuit_breaker_timeout_secs),
            ),
            records: RwLock::new(Vec::new()),
            recent_failures: RwLock::new(VecDeque::new()),
            pattern_counts: RwLock::new(HashMap::new()),
            pattern_overrides: RwLock::new(HashMap::new()),
            cascade_window: Duration::from_secs(config.cascade_window_secs),
            cascade_threshold: config.cascade_threshold,
            pattern_match_threshold: config.pattern_match_threshold as u32,
            max_attempts: config.max_recovery_attempts,
            base_backoff: Duration::from_secs(5),
            emergency_stop: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Report a failure. Returns the chosen strategy and whether a cascade
    /// was newly detected this call.
    pub fn report(
        &self,
        kind: FailureKind,
        entity_id: impl Into<String>,
        entity_kind: EntityKind,
        severity: Severity,
        context: BTreeMap<String, String>,
        flags: FailureContextFlags,
    ) -> (RecoveryStrategy, bool) {
        let mut record = FailureRecord::new(kind, entity_id, entity_kind, severity, context);
        let cascaded = self.note_for_cascade(record.timestamp);

        let pattern_key = record.pattern_key();
        let strategy = {
            let mut counts = self.pattern_counts.write().expect("lock poisoned");
            let count = counts.entry(pattern_key.clone()).or_insert(0);
            *count += 1;
            if *count >= self.pattern_match_threshold {
                // The same failure pattern recurring past the threshold means
                // the default response already failed to fix it; learn a
                // stronger override instead of reapplying the same default.
                self.pattern_overrides
                    .write()
                    .expect("lock poisoned")
                    .entry(pattern_key.clone())
                    .or_insert_with(|| escalate_strategy(default_strategy(kind, severity, flags)));
            }
            self.pattern_overrides
                .read()
                .expect("lock poisoned")
                .get(&pattern_key)
                .copied()
                .unwrap_or_else(|| default_strategy(kind, severity, flags))
        };

        record.actions.push(strategy);
        record.status = FailureStatus::Recovering;
        self.records.write().expect("lock poisoned").push(record);

        if cascaded {
            warn!("cascade detected: escalating to EmergencyStop");
            self.emergency_stop.store(true, Ordering::SeqCst);
            let mut cascade_record = FailureRecord::new(
                FailureKind::CascadingFailure,
                "swarm",
                EntityKind::Swarm,
                Severity::Critical,
                BTreeMap::new(),
            );
            cascade_record.actions.push(RecoveryStrategy::EmergencyStop);
            cascade_record.status = FailureStatus::Recovering;
            self.records.write().expect("lock poisoned").push(cascade_record);
            return (RecoveryStrategy::EmergencyStop, true);
        }

        (strategy, false)
    }

    /// Sliding-window cascade check: records the failure instant and
    /// returns true iff the window now holds >= threshold distinct events.
    fn note_for_cascade(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        let mut recent = self.recent_failures.write().expect("lock poisoned");
        recent.push_back(at);
        let window = chrono::Duration::from_std(self.cascade_window).unwrap_or_default();
        while let Some(front) = recent.front() {
            if at.signed_duration_since(*front) > window {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.len() >= self.cascade_threshold
    }

    /// Exponential backoff for the Nth recovery attempt: `5 * 2^attempt`
    /// seconds, per spec §4.5.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn mark_resolved(&self, record_id: &str) {
        let mut records = self.records.write().expect("lock poisoned");
        if let Some(record) = records.iter_mut().find(|r| r.id == record_id) {
            record.resolved = true;
            record.resolved_at = Some(chrono::Utc::now());
            record.status = FailureStatus::Resolved;
        } else {
            error!(record_id, "attempted to resolve unknown failure record");
        }
    }

    #[must_use]
    pub fn active_records(&self) -> Vec<FailureRecord> {
        self.records
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|r| !r.resolved)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureRecoveryConfig;

    fn manager() -> RecoveryManager {
        RecoveryManager::new(&FailureRecoveryConfig {
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            cascade_window_secs: 30,
            cascade_threshold: 3,
            max_recovery_attempts: 3,
            pattern_match_threshold: 3,
        })
    }

    #[test]
    fn three_distinct_failures_trigger_cascade() {
        let mgr = manager();
        let (_, c1) = mgr.report(
            FailureKind::AgentCrash,
            "a1",
            EntityKind::Agent,
            Severity::High,
            BTreeMap::new(),
            FailureContextFlags::default(),
        );
        let (_, c2) = mgr.report(
            FailureKind::TaskError,
            "a2",
            EntityKind::Agent,
            Severity::Medium,
            BTreeMap::new(),
            FailureContextFlags::default(),
        );
        let (strategy, c3) = mgr.report(
            FailureKind::CommunicationFailure,
            "a3",
            EntityKind::Agent,
            Severity::Medium,
            BTreeMap::new(),
            FailureContextFlags::default(),
        );
        assert!(!c1 && !c2 && c3);
        assert_eq!(strategy, RecoveryStrategy::EmergencyStop);
        assert!(mgr.is_emergency_stopped());
    }

    #[test]
    fn recurring_pattern_escalates_past_the_default_strategy() {
        let mgr = RecoveryManager::new(&FailureRecoveryConfig {
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            cascade_window_secs: 30,
            // High enough that these two reports alone don't also trip the
            // unrelated cascade check, which would mask the override.
            cascade_threshold: 10,
            max_recovery_attempts: 3,
            pattern_match_threshold: 2,
        });

        let (first, _) = mgr.report(
            FailureKind::AgentCrash,
            "a1",
            EntityKind::Agent,
            Severity::Low,
            BTreeMap::new(),
            FailureContextFlags::default(),
        );
        assert_eq!(first, RecoveryStrategy::Relocate);

        let (second, _) = mgr.report(
            FailureKind::AgentCrash,
            "a1",
            EntityKind::Agent,
            Severity::Low,
            BTreeMap::new(),
            FailureContextFlags::default(),
        );
        assert_eq!(second, RecoveryStrategy::Isolate);
        assert_ne!(second, default_strategy(FailureKind::AgentCrash, Severity::Low, FailureContextFlags::default()));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let mgr = manager();
        assert_eq!(mgr.backoff_for_attempt(0), Duration::from_secs(5));
        assert_eq!(mgr.backoff_for_attempt(1), Duration::from_secs(10));
        assert_eq!(mgr.backoff_for_attempt(2), Duration::from_secs(20));
    }
}
