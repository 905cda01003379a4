use crate::constants::retry_defaults;
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * multiplier^attempt`
    #[default]
    Exponential,
    /// `base_delay * attempt`
    Linear,
    /// Exponential with a random factor in [0.5, 1.5]
    Jittered,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Exponential => write!(f, "exponential"),
            Self::Linear => write!(f, "linear"),
            Self::Jittered => write!(f, "jittered"),
        }
    }
}

/// Per-task retry policy
///
/// `retryable_error_kinds` restricts which error kinds may be retried; an empty
/// list means every non-fatal kind is eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "crate::utils::serde::duration_millis")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "crate::utils::serde::duration_millis")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub retryable_error_kinds: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry_defaults::MAX_ATTEMPTS,
            base_delay: retry_defaults::BASE_DELAY,
            backoff_multiplier: retry_defaults::BACKOFF_MULTIPLIER,
            max_delay: retry_defaults::MAX_DELAY,
            strategy: BackoffStrategy::Exponential,
            retryable_error_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential policy limited to transient error kinds, capped at 30 seconds
    pub fn default_transient() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            retryable_error_kinds: vec![
                "timeout".to_string(),
                "connection".to_string(),
                "temporary".to_string(),
            ],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Whether an error kind name is eligible under this policy's kind filter
    pub fn allows_kind(&self, kind: &str) -> bool {
        self.retryable_error_kinds.is_empty()
            || self.retryable_error_kinds.iter().any(|k| k == kind)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::InvalidWorkflowConfig(
                "retry policy max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(OrchestratorError::InvalidWorkflowConfig(format!(
                "retry policy backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(OrchestratorError::InvalidWorkflowConfig(format!(
                "retry policy base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}
