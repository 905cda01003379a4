//! # Orchestrator Configuration System
//!
//! Layered, validated configuration for the orchestrator runtime.
//!
//! ## Architecture
//!
//! - **Defaults in code**: [`OrchestratorConfig::default`] is a complete, valid configuration
//! - **Environment Awareness**: `config/orchestrator.toml` is overlaid by
//!   `config/orchestrator.<env>.toml`
//! - **Environment Overrides**: `REVIEW_ORCHESTRATOR__SECTION__FIELD` variables win last
//! - **Explicit Validation**: inconsistent settings are rejected at load time
//!
//! ## Usage
//!
//! ```rust,no_run
//! use review_orchestrator::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().worker_pool.worker_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::models::RetryPolicy;
use crate::orchestration::error_classifier::ErrorClassifierConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker_pool: WorkerPoolConfig,

    /// Retry policy applied by the persistence retry loop
    pub retry: RetryPolicy,

    pub monitoring: MonitoringConfig,

    /// Per-error-kind recovery rules
    pub classifier: ErrorClassifierConfig,

    pub limits: LimitsConfig,
}

/// Worker pool sizing and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// How long an idle worker waits for a wake-up before polling again
    pub idle_poll_interval_ms: u64,
    /// Queue capacity; unbounded when absent
    pub max_queue_size: Option<usize>,
    /// Grace period for in-flight tasks at shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            idle_poll_interval_ms: 100,
            max_queue_size: None,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Metrics retention and summary caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default window for performance summaries and the retention of finished workflows
    pub retention_hours: u64,
    pub summary_cache_ttl_seconds: u64,
    /// Period of the background cleanup task; zero disables it
    pub cleanup_interval_seconds: u64,
    /// Events kept in each workflow's event log
    pub max_events_per_workflow: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            summary_cache_ttl_seconds: 300,
            cleanup_interval_seconds: 3_600,
            max_events_per_workflow: 1_000,
        }
    }
}

impl MonitoringConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3_600)
    }

    pub fn summary_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.summary_cache_ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_seconds > 0).then(|| Duration::from_secs(self.cleanup_interval_seconds))
    }
}

/// Admission limits for submitted workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_tasks_per_workflow: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_workflow: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Validate configuration consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker_pool.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.worker_count",
                0,
                "at least one worker is required",
            ));
        }
        if self.worker_pool.idle_poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.idle_poll_interval_ms",
                0,
                "idle poll interval must be greater than 0",
            ));
        }
        if self.worker_pool.max_queue_size == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.max_queue_size",
                0,
                "queue capacity must be greater than 0 when set",
            ));
        }

        self.retry
            .validate()
            .map_err(|e| ConfigurationError::invalid_value("retry", "policy", e.to_string()))?;

        if self.monitoring.retention_hours == 0 {
            return Err(ConfigurationError::invalid_value(
                "monitoring.retention_hours",
                0,
                "retention must be at least one hour",
            ));
        }
        if self.monitoring.max_events_per_workflow == 0 {
            return Err(ConfigurationError::invalid_value(
                "monitoring.max_events_per_workflow",
                0,
                "event log capacity must be greater than 0",
            ));
        }

        for (kind, rule) in &self.classifier.rules {
            if rule.max_attempts == Some(0) {
                return Err(ConfigurationError::invalid_value(
                    format!("classifier.rules.{kind}.max_attempts"),
                    0,
                    "a retry rule must allow at least one attempt",
                ));
            }
            if let Some(multiplier) = rule.backoff_multiplier {
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(ConfigurationError::invalid_value(
                        format!("classifier.rules.{kind}.backoff_multiplier"),
                        multiplier,
                        "multiplier must be a finite number >= 1.0",
                    ));
                }
            }
            if let Some(delay) = rule.delay {
                if delay > self.retry.max_delay {
                    return Err(ConfigurationError::Inconsistent(format!(
                        "classifier rule '{kind}' delay {}ms exceeds retry.max_delay {}ms",
                        delay.as_millis(),
                        self.retry.max_delay.as_millis()
                    )));
                }
            }
        }

        if self.limits.max_tasks_per_workflow == 0 {
            return Err(ConfigurationError::invalid_value(
                "limits.max_tasks_per_workflow",
                0,
                "workflows must be allowed at least one task",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::error_classifier::RecoveryRule;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_pool.worker_count, 5);
        assert_eq!(config.monitoring.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.monitoring.cleanup_interval(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = OrchestratorConfig::default();
        config.worker_pool.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worker_pool.worker_count"));
    }

    #[test]
    fn test_rule_delay_beyond_max_delay_is_inconsistent() {
        let mut config = OrchestratorConfig::default();
        config.classifier.rules.insert(
            "timeout".to_string(),
            RecoveryRule::retry(config.retry.max_delay + Duration::from_secs(1), 3),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"worker_pool": {"worker_count": 8}}"#).unwrap();
        assert_eq!(config.worker_pool.worker_count, 8);
        assert_eq!(config.worker_pool.idle_poll_interval_ms, 100);
        assert_eq!(config.monitoring, MonitoringConfig::default());
    }
}
