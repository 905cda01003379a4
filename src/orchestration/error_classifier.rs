//! # Task Error Classification
//!
//! Maps a failed task attempt to a recovery action.
//!
//! ## Overview
//!
//! Every handler failure is routed through an [`ErrorClassifier`] which decides
//! whether the task is retried (and after what delay), skipped, or failed. The
//! decision feeds directly into the workflow coordinator:
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ TaskError       │────▶│ ErrorClassifier │────▶│ RecoveryAction  │
//! │ + ErrorContext  │     │ Strategy        │     │ retry/skip/fail │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! ## Default Rules
//!
//! - Missing handlers and cancellations always fail.
//! - A [`RecoveryRule`] registered for the error kind takes precedence.
//! - Otherwise the task's [`RetryPolicy`](crate::models::RetryPolicy) decides:
//!   transient kinds retry while attempts remain, fatal kinds fail.
//! - A failure of a task marked `skip_on_failure` becomes a skip.
//!
//! ## Usage
//!
//! ```rust
//! use review_orchestrator::models::TaskDefinition;
//! use review_orchestrator::orchestration::error_classifier::{
//!     ErrorClassifier, ErrorContext, RecoveryAction, StandardErrorClassifier,
//! };
//! use review_orchestrator::orchestration::errors::TaskError;
//! use uuid::Uuid;
//!
//! let classifier = StandardErrorClassifier::new();
//! let task = TaskDefinition::new("fetch_diff");
//! let context = ErrorContext::new(Uuid::new_v4(), &task, 1);
//!
//! let classification = classifier.classify_error(&TaskError::connection("reset"), &context);
//! assert!(matches!(classification.action, RecoveryAction::Retry { .. }));
//! ```

use crate::models::{TaskDefinition, WorkflowId};
use crate::orchestration::backoff_calculator::{compute_delay, should_retry};
use crate::orchestration::errors::{ErrorKind, TaskError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Context information for error classification
#[derive(Debug, Clone)]
pub struct ErrorContext<'a> {
    pub workflow_id: WorkflowId,

    /// Definition of the task that failed
    pub task: &'a TaskDefinition,

    /// Number of the attempt that failed (1-based)
    pub attempt_number: u32,

    /// How long the attempt ran before failing
    pub execution_duration: Option<Duration>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(workflow_id: WorkflowId, task: &'a TaskDefinition, attempt_number: u32) -> Self {
        Self {
            workflow_id,
            task,
            attempt_number,
            execution_duration: None,
        }
    }

    pub fn with_execution_duration(mut self, duration: Duration) -> Self {
        self.execution_duration = Some(duration);
        self
    }
}

/// What to do with a failed task
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Re-queue the task after `delay`
    Retry { delay: Duration },
    /// Treat the task as done without a result
    Skip { reason: String },
    /// Fail the task and its workflow
    Fail { reason: String },
}

impl RecoveryAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Skip { .. } => "skip",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Primary error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - may succeed on retry
    Transient,
    /// Handler ran past its deadline
    Timeout,
    /// Network or connectivity problem
    Network,
    /// Permanent error - will never succeed if retried
    Permanent,
    /// Setup problem such as a missing handler
    Configuration,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub fn from_kind(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Connection => Self::Network,
            ErrorKind::Temporary => Self::Transient,
            ErrorKind::Validation | ErrorKind::Contract => Self::Permanent,
            ErrorKind::MissingHandler => Self::Configuration,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Other(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Network => write!(f, "Network"),
            Self::Permanent => write!(f, "Permanent"),
            Self::Configuration => write!(f, "Configuration"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub action: RecoveryAction,
    pub error_category: ErrorCategory,
    pub error_kind: String,
    pub error_message: String,
    /// No further attempt will be made for this task
    pub is_final_attempt: bool,
    /// A registered rule (rather than the retry policy) decided the action
    pub matched_rule: bool,
}

/// Action half of a [`RecoveryRule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Retry,
    Skip,
    Fail,
}

/// Per-error-kind override of the default recovery behaviour
///
/// A retry rule never allows more attempts than the task's own policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub action: RuleAction,
    /// First retry delay; later retries scale by `backoff_multiplier`
    #[serde(
        default,
        rename = "delay_ms",
        skip_serializing_if = "Option::is_none",
        with = "option_duration_millis"
    )]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl RecoveryRule {
    pub fn retry(delay: Duration, max_attempts: u32) -> Self {
        Self {
            action: RuleAction::Retry,
            delay: Some(delay),
            max_attempts: Some(max_attempts),
            backoff_multiplier: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            action: RuleAction::Skip,
            delay: None,
            max_attempts: None,
            backoff_multiplier: None,
        }
    }

    pub fn fail() -> Self {
        Self {
            action: RuleAction::Fail,
            ..Self::skip()
        }
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }
}

/// Configuration for error classification behavior
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorClassifierConfig {
    /// Rules keyed by error kind name (`timeout`, `connection`, ...)
    pub rules: HashMap<String, RecoveryRule>,
}

/// Aggregate counts of classified errors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_kind: HashMap<String, u64>,
    pub most_common_kind: Option<String>,
    pub retries: u64,
    pub skips: u64,
    pub failures: u64,
}

/// Trait for error classification strategies
pub trait ErrorClassifier: Send + Sync {
    /// Classify a failed attempt and decide how to recover
    fn classify_error(&self, error: &TaskError, context: &ErrorContext<'_>)
        -> ErrorClassification;

    /// Get the classifier name for identification
    fn classifier_name(&self) -> &'static str;

    /// Counts of errors seen so far
    fn error_stats(&self) -> ErrorStats {
        ErrorStats::default()
    }
}

/// Standard error classifier backed by the task retry policy and registered rules
pub struct StandardErrorClassifier {
    rules: RwLock<HashMap<String, RecoveryRule>>,
    stats: Mutex<ErrorStats>,
}

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self::with_config(ErrorClassifierConfig::default())
    }

    pub fn with_config(config: ErrorClassifierConfig) -> Self {
        Self {
            rules: RwLock::new(config.rules),
            stats: Mutex::new(ErrorStats::default()),
        }
    }

    /// Register (or replace) the rule for an error kind
    pub fn register_rule(&self, kind: &ErrorKind, rule: RecoveryRule) {
        self.rules.write().insert(kind.name().to_string(), rule);
    }

    pub fn rule_for(&self, kind: &ErrorKind) -> Option<RecoveryRule> {
        self.rules.read().get(kind.name()).cloned()
    }

    fn default_action(&self, error: &TaskError, context: &ErrorContext<'_>) -> RecoveryAction {
        let policy = &context.task.retry_policy;
        let attempt = context.attempt_number;
        if should_retry(policy, error, attempt) {
            return RecoveryAction::Retry {
                delay: compute_delay(policy, attempt),
            };
        }
        let reason = if error.kind.is_fatal() {
            format!("non-retryable {} error: {}", error.kind, error.message)
        } else if attempt >= policy.max_attempts {
            format!(
                "retries exhausted after {attempt} attempts: {}",
                error.message
            )
        } else {
            format!(
                "{} errors are not retryable for task '{}': {}",
                error.kind, context.task.name, error.message
            )
        };
        RecoveryAction::Fail { reason }
    }

    fn rule_action(
        &self,
        rule: &RecoveryRule,
        error: &TaskError,
        context: &ErrorContext<'_>,
    ) -> RecoveryAction {
        let policy = &context.task.retry_policy;
        let attempt = context.attempt_number;
        match rule.action {
            RuleAction::Retry => {
                let max_attempts = rule
                    .max_attempts
                    .map_or(policy.max_attempts, |max| max.min(policy.max_attempts));
                if attempt >= max_attempts {
                    return RecoveryAction::Fail {
                        reason: format!(
                            "retries exhausted after {attempt} attempts: {}",
                            error.message
                        ),
                    };
                }
                let delay = match rule.delay {
                    Some(delay) => {
                        let multiplier = rule.backoff_multiplier.unwrap_or(1.0);
                        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                        let seconds = delay.as_secs_f64() * multiplier.powi(exponent);
                        if seconds.is_finite() && seconds < policy.max_delay.as_secs_f64() {
                            Duration::from_secs_f64(seconds.max(0.0))
                        } else {
                            policy.max_delay
                        }
                    }
                    None => compute_delay(policy, attempt),
                };
                RecoveryAction::Retry { delay }
            }
            RuleAction::Skip => RecoveryAction::Skip {
                reason: format!("{} error skipped by rule: {}", error.kind, error.message),
            },
            RuleAction::Fail => RecoveryAction::Fail {
                reason: format!("{} error failed by rule: {}", error.kind, error.message),
            },
        }
    }

    fn record(&self, kind: &str, action: &RecoveryAction) {
        let mut stats = self.stats.lock();
        stats.total_errors += 1;
        *stats.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        match action {
            RecoveryAction::Retry { .. } => stats.retries += 1,
            RecoveryAction::Skip { .. } => stats.skips += 1,
            RecoveryAction::Fail { .. } => stats.failures += 1,
        }
        stats.most_common_kind = stats
            .errors_by_kind
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| kind.clone());
    }
}

impl Default for StandardErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_error(
        &self,
        error: &TaskError,
        context: &ErrorContext<'_>,
    ) -> ErrorClassification {
        let always_fails = matches!(error.kind, ErrorKind::MissingHandler | ErrorKind::Cancelled);

        let (mut action, matched_rule) = if always_fails {
            (
                RecoveryAction::Fail {
                    reason: error.message.clone(),
                },
                false,
            )
        } else if let Some(rule) = self.rule_for(&error.kind) {
            (self.rule_action(&rule, error, context), true)
        } else {
            (self.default_action(error, context), false)
        };

        if context.task.skip_on_failure && !always_fails {
            if let RecoveryAction::Fail { reason } = &action {
                action = RecoveryAction::Skip {
                    reason: format!("non-critical task '{}' skipped: {reason}", context.task.name),
                };
            }
        }

        self.record(error.kind.name(), &action);

        debug!(
            workflow_id = %context.workflow_id,
            task_name = %context.task.name,
            attempt = context.attempt_number,
            error_kind = %error.kind,
            action = action.name(),
            "Classified task error"
        );

        ErrorClassification {
            is_final_attempt: !matches!(action, RecoveryAction::Retry { .. }),
            action,
            error_category: ErrorCategory::from_kind(&error.kind),
            error_kind: error.kind.name().to_string(),
            error_message: error.message.clone(),
            matched_rule,
        }
    }

    fn classifier_name(&self) -> &'static str {
        "StandardErrorClassifier"
    }

    fn error_stats(&self) -> ErrorStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetryPolicy;
    use uuid::Uuid;

    fn task() -> TaskDefinition {
        TaskDefinition::new("analyze").with_retry_policy(
            RetryPolicy::default()
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_secs(1)),
        )
    }

    fn classify(
        classifier: &StandardErrorClassifier,
        task: &TaskDefinition,
        error: TaskError,
        attempt: u32,
    ) -> ErrorClassification {
        classifier.classify_error(&error, &ErrorContext::new(Uuid::new_v4(), task, attempt))
    }

    #[test]
    fn test_transient_errors_retry_until_exhausted() {
        let classifier = StandardErrorClassifier::new();
        let task = task();

        let first = classify(&classifier, &task, TaskError::timeout("slow"), 1);
        assert_eq!(
            first.action,
            RecoveryAction::Retry {
                delay: Duration::from_millis(20)
            }
        );
        assert!(!first.is_final_attempt);
        assert_eq!(first.error_category, ErrorCategory::Timeout);

        let last = classify(&classifier, &task, TaskError::timeout("slow"), 3);
        assert!(matches!(last.action, RecoveryAction::Fail { .. }));
        assert!(last.is_final_attempt);
    }

    #[test]
    fn test_validation_errors_fail_immediately() {
        let classifier = StandardErrorClassifier::new();
        let result = classify(&classifier, &task(), TaskError::validation("bad"), 1);
        assert!(matches!(result.action, RecoveryAction::Fail { .. }));
        assert_eq!(result.error_category, ErrorCategory::Permanent);
    }

    #[test]
    fn test_skip_on_failure_turns_fail_into_skip() {
        let classifier = StandardErrorClassifier::new();
        let task = task().skippable();
        let result = classify(&classifier, &task, TaskError::contract("schema mismatch"), 1);
        assert!(matches!(result.action, RecoveryAction::Skip { .. }));

        // Missing handlers are never skipped.
        let result = classify(&classifier, &task, TaskError::missing_handler("analyze"), 1);
        assert!(matches!(result.action, RecoveryAction::Fail { .. }));
    }

    #[test]
    fn test_registered_rule_overrides_policy() {
        let classifier = StandardErrorClassifier::new();
        classifier.register_rule(
            &ErrorKind::Connection,
            RecoveryRule::retry(Duration::from_millis(5), 5).with_backoff_multiplier(2.0),
        );
        let task = task();

        let result = classify(&classifier, &task, TaskError::connection("reset"), 2);
        assert!(result.matched_rule);
        assert_eq!(
            result.action,
            RecoveryAction::Retry {
                delay: Duration::from_millis(10)
            }
        );

        // The task policy still caps attempts at 3.
        let result = classify(&classifier, &task, TaskError::connection("reset"), 3);
        assert!(matches!(result.action, RecoveryAction::Fail { .. }));

        classifier.register_rule(&ErrorKind::Validation, RecoveryRule::skip());
        let result = classify(&classifier, &task, TaskError::validation("bad"), 1);
        assert!(matches!(result.action, RecoveryAction::Skip { .. }));
    }

    #[test]
    fn test_error_stats() {
        let classifier = StandardErrorClassifier::new();
        let task = task();
        classify(&classifier, &task, TaskError::timeout("a"), 1);
        classify(&classifier, &task, TaskError::timeout("b"), 2);
        classify(&classifier, &task, TaskError::validation("c"), 1);

        let stats = classifier.error_stats();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.errors_by_kind["timeout"], 2);
        assert_eq!(stats.most_common_kind.as_deref(), Some("timeout"));
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_config_rules_deserialize() {
        let json = r#"{"rules": {"timeout": {"action": "retry", "delay_ms": 5000, "max_attempts": 3}}}"#;
        let config: ErrorClassifierConfig = serde_json::from_str(json).unwrap();
        let classifier = StandardErrorClassifier::with_config(config);
        let rule = classifier.rule_for(&ErrorKind::Timeout).unwrap();
        assert_eq!(rule.delay, Some(Duration::from_secs(5)));
        assert_eq!(rule.max_attempts, Some(3));
    }
}
