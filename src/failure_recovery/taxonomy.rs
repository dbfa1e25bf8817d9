//! Failure kinds, severities, and the default kind → strategy mapping
//! from spec §4.5.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    AgentCrash,
    AgentUnresponsive,
    AgentOverload,
    TaskTimeout,
    TaskError,
    CommunicationFailure,
    ResourceExhaustion,
    NetworkPartition,
    CoordinationFailure,
    CascadingFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Agent,
    Swarm,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    Restart,
    Relocate,
    ScaleUp,
    ScaleDown,
    Isolate,
    CircuitBreak,
    GracefulDegradation,
    EmergencyStop,
}

/// Lifecycle stage of a `FailureRecord`, independent of the `resolved` flag:
/// a record can sit in `Recovering` across several attempts before it is
/// either resolved or gives up as `Unrecoverable` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStatus {
    Detected,
    Recovering,
    Resolved,
    Unrecoverable,
}

/// Extra facts a failure may carry that the default mapping needs to
/// disambiguate a kind into more than one strategy (e.g. `TaskTimeout`
/// with/without a retry remaining).
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureContextFlags {
    pub retryable: bool,
}

/// Strengthens a strategy once a pattern of failures recurs past the
/// learning threshold: a one-off failure gets the default, mild response,
/// but a recurring pattern means that response isn't working and the
/// recovery manager should reach for something stronger (spec §4.5
/// "learned patterns" override the default mapping).
#[must_use]
pub fn escalate_strategy(strategy: RecoveryStrategy) -> RecoveryStrategy {
    match strategy {
        RecoveryStrategy::Restart => RecoveryStrategy::Relocate,
        RecoveryStrategy::Relocate => RecoveryStrategy::Isolate,
        RecoveryStrategy::ScaleUp => RecoveryStrategy::Isolate,
        RecoveryStrategy::ScaleDown => RecoveryStrategy::Isolate,
        RecoveryStrategy::GracefulDegradation => RecoveryStrategy::CircuitBreak,
        RecoveryStrategy::CircuitBreak => RecoveryStrategy::Isolate,
        RecoveryStrategy::Isolate => RecoveryStrategy::EmergencyStop,
        RecoveryStrategy::EmergencyStop => RecoveryStrategy::EmergencyStop,
    }
}

/// Default strategy for a failure kind/severity/context, per the table in
/// spec §4.5. Callers check learned pattern overrides before falling back
/// to this.
#[must_use]
pub fn default_strategy(
    kind: FailureKind,
    severity: Severity,
    flags: FailureContextFlags,
) -> RecoveryStrategy {
    match kind {
        FailureKind::AgentCrash if severity >= Severity::High => RecoveryStrategy::Restart,
        FailureKind::AgentCrash => RecoveryStrategy::Relocate,
        FailureKind::AgentUnresponsive => RecoveryStrategy::Restart,
        FailureKind::AgentOverload => RecoveryStrategy::ScaleUp,
        FailureKind::TaskTimeout if flags.retryable => RecoveryStrategy::Relocate,
        FailureKind::TaskTimeout => RecoveryStrategy::GracefulDegradation,
        FailureKind::TaskError => RecoveryStrategy::Relocate,
        FailureKind::CommunicationFailure => RecoveryStrategy::CircuitBreak,
        FailureKind::ResourceExhaustion => RecoveryStrategy::ScaleUp,
        FailureKind::NetworkPartition => RecoveryStrategy::Isolate,
        FailureKind::CoordinationFailure => RecoveryStrategy::Restart,
        FailureKind::CascadingFailure => RecoveryStrategy::EmergencyStop,
    }
}

/// A failure record, `{id, kind, entityId, entityKind, severity, context,
/// timestamp, status, attempts, actions, resolved, resolvedAt}` (spec §3).
/// `status` tracks recovery lifecycle stage; `resolved`/`resolvedAt` mark
/// the terminal outcome once the record leaves the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub kind: FailureKind,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub severity: Severity,
    pub context: std::collections::BTreeMap<String, String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: FailureStatus,
    pub attempts: u32,
    pub actions: Vec<RecoveryStrategy>,
    pub resolved: bool,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl FailureRecord {
    #[must_use]
    pub fn new(
        kind: FailureKind,
        entity_id: impl Into<String>,
        entity_kind: EntityKind,
        severity: Severity,
        context: std::collections::BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_id: entity_id.into(),
            entity_kind,
            severity,
            context,
            timestamp: chrono::Utc::now(),
            status: FailureStatus::Detected,
            attempts: 0,
            actions: Vec::new(),
            resolved: false,
            resolved_at: None,
        }
    }

    /// Projection used for pattern recognition: `{kind, entityKind, severity,
    /// hourOfDay, dayOfWeek, contextKeys (sorted)}`.
    #[must_use]
    pub fn pattern_key(&self) -> String {
        use chrono::{Datelike, Timelike};
        let mut keys: Vec<&String> = self.context.keys().collect();
        keys.sort();
        format!(
            "{:?}|{:?}|{:?}|{}|{}|{:?}",
            self.kind,
            self.entity_kind,
            self.severity,
            self.timestamp.hour(),
            self.timestamp.weekday(),
            keys
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_crash_severity_selects_strategy() {
        assert_eq!(
            default_strategy(FailureKind::AgentCrash, Severity::Critical, FailureContextFlags::default()),
            RecoveryStrategy::Restart
        );
        assert_eq!(
            default_strategy(FailureKind::AgentCrash, Severity::Low, FailureContextFlags::default()),
            RecoveryStrategy::Relocate
        );
    }

    #[test]
    fn task_timeout_depends_on_retryable_flag() {
        assert_eq!(
            default_strategy(
                FailureKind::TaskTimeout,
                Severity::Medium,
                FailureContextFlags { retryable: true }
            ),
            RecoveryStrategy::Relocate
        );
        assert_eq!(
            default_strategy(
                FailureKind::TaskTimeout,
                Severity::Medium,
                FailureContextFlags { retryable: false }
            ),
            RecoveryStrategy::GracefulDegradation
        );
    }

    #[test]
    fn cascading_failure_is_always_emergency_stop() {
        assert_eq!(
            default_strategy(FailureKind::CascadingFailure, Severity::Critical, FailureContextFlags::default()),
            RecoveryStrategy::EmergencyStop
        );
    }
}
