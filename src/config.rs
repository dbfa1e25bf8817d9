//! Coordinator configuration.
//!
//! Layered the way the teacher's `utils/config.rs` layers `HiveConfig`:
//! struct defaults first, then an optional TOML file, then environment
//! variable overrides for the handful of settings operators tend to flip
//! per-deployment.

use crate::error::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub load_balancer: LoadBalancerConfig,
    pub topology: TopologyConfig,
    pub failure_recovery: FailureRecoveryConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub outbound_queue_capacity: usize,
    pub register_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub spawn_timeout_secs: u64,
    pub aging_interval_secs: u64,
    pub base_retry_delay_secs: u64,
    pub default_max_retries: u32,
    pub default_task_timeout_secs: u64,
    pub heartbeat_scan_secs: u64,
    pub health_check_secs: u64,
    pub checkpoint_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadBalancerStrategyConfig {
    RoundRobin,
    LeastLoaded,
    WeightedRoundRobin,
    ResourceAware,
    PerformanceBased,
    Predictive,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancerStrategyConfig,
    pub weight_recompute_secs: u64,
    pub load_recompute_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub pattern: String,
    pub adaptation_enabled: bool,
    pub adaptation_window_secs: u64,
    pub adaptation_threshold: f64,
    pub max_adaptations_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecoveryConfig {
    pub circuit_breaker_threshold: u64,
    pub circuit_breaker_timeout_secs: u64,
    pub cascade_window_secs: u64,
    pub cascade_threshold: usize,
    pub max_recovery_attempts: u32,
    pub pattern_match_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub namespace: String,
    pub checkpoint_key: String,
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7420,
                outbound_queue_capacity: 1024,
                register_deadline_secs: 30,
            },
            orchestrator: OrchestratorConfig {
                max_agents: 256,
                spawn_timeout_secs: 30,
                aging_interval_secs: 60,
                base_retry_delay_secs: 5,
                default_max_retries: 3,
                default_task_timeout_secs: 300,
                heartbeat_scan_secs: 5,
                health_check_secs: 10,
                checkpoint_interval_secs: 60,
            },
            load_balancer: LoadBalancerConfig {
                strategy: LoadBalancerStrategyConfig::LeastLoaded,
                weight_recompute_secs: 60,
                load_recompute_secs: 30,
            },
            topology: TopologyConfig {
                pattern: "mesh".to_string(),
                adaptation_enabled: false,
                adaptation_window_secs: 300,
                adaptation_threshold: 0.15,
                max_adaptations_per_hour: 3,
            },
            failure_recovery: FailureRecoveryConfig {
                circuit_breaker_threshold: 5,
                circuit_breaker_timeout_secs: 60,
                cascade_window_secs: 30,
                cascade_threshold: 3,
                max_recovery_attempts: 3,
                pattern_match_threshold: 3,
            },
            persistence: PersistenceConfig {
                namespace: "swarm".to_string(),
                checkpoint_key: "orchestrator/state".to_string(),
                database_path: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }
}

impl CoordinatorConfig {
    /// Load defaults, then an optional TOML file, then environment overrides.
    pub fn load() -> CoordinatorResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = env::var("SWARM_CONFIG_FILE") {
            config = Self::from_file(path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CoordinatorResult<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| CoordinatorError::Configuration {
                reason: format!("failed to read config file: {e}"),
            })?;
        toml::from_str(&contents).map_err(|e| CoordinatorError::Configuration {
            reason: format!("failed to parse config file: {e}"),
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("SWARM_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("SWARM_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(max_agents) = env::var("SWARM_MAX_AGENTS") {
            if let Ok(max_agents) = max_agents.parse() {
                self.orchestrator.max_agents = max_agents;
            }
        }
        if let Ok(level) = env::var("SWARM_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    #[must_use]
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.spawn_timeout_secs)
    }

    #[must_use]
    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.aging_interval_secs)
    }

    #[must_use]
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.orchestrator.base_retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.orchestrator.spawn_timeout_secs, 30);
        assert_eq!(config.orchestrator.aging_interval_secs, 60);
        assert_eq!(config.orchestrator.base_retry_delay_secs, 5);
        assert_eq!(config.orchestrator.default_max_retries, 3);
        assert_eq!(config.failure_recovery.circuit_breaker_threshold, 5);
        assert_eq!(config.failure_recovery.circuit_breaker_timeout_secs, 60);
        assert_eq!(config.failure_recovery.cascade_window_secs, 30);
        assert_eq!(config.failure_recovery.cascade_threshold, 3);
        assert_eq!(config.server.outbound_queue_capacity, 1024);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("SWARM_MAX_AGENTS", "42");
        let mut config = CoordinatorConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.orchestrator.max_agents, 42);
        std::env::remove_var("SWARM_MAX_AGENTS");
    }
}
