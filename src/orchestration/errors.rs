//! Task execution errors
//!
//! Handlers report failures as [`TaskError`]s carrying an [`ErrorKind`]. The kind
//! drives classification: transient kinds may be retried, fatal kinds fail the
//! task immediately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Temporary,
    Validation,
    Contract,
    MissingHandler,
    Cancelled,
    Other(String),
}

impl ErrorKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Temporary => "temporary",
            Self::Validation => "validation",
            Self::Contract => "contract",
            Self::MissingHandler => "missing_handler",
            Self::Cancelled => "cancelled",
            Self::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "timeout" => Self::Timeout,
            "connection" => Self::Connection,
            "temporary" => Self::Temporary,
            "validation" => Self::Validation,
            "contract" => Self::Contract,
            "missing_handler" => Self::MissingHandler,
            "cancelled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    /// Timeouts, connectivity problems and explicitly temporary conditions
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection | Self::Temporary)
    }

    /// Kinds that are never retried regardless of policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation | Self::Contract | Self::MissingHandler | Self::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported by (or on behalf of) a task handler
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Raised by a worker slot when a handler exceeds its task timeout
    pub fn timed_out(task_name: &str, timeout: Duration) -> Self {
        Self::timeout(format!(
            "task '{task_name}' exceeded timeout of {}ms",
            timeout.as_millis()
        ))
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Temporary, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract, message)
    }

    pub fn missing_handler(task_name: &str) -> Self {
        Self::new(
            ErrorKind::MissingHandler,
            format!("no handler registered for task '{task_name}'"),
        )
    }

    pub fn cancelled(task_name: &str) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            format!("task '{task_name}' was cancelled"),
        )
    }

    pub fn other(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_name(&kind.into()), message)
    }

    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Connection,
            ErrorKind::Temporary,
            ErrorKind::Validation,
            ErrorKind::Contract,
            ErrorKind::MissingHandler,
            ErrorKind::Cancelled,
            ErrorKind::Other("rate_limited".to_string()),
        ] {
            assert_eq!(ErrorKind::from_name(kind.name()), kind);
        }
    }

    #[test]
    fn test_other_maps_known_names() {
        assert_eq!(TaskError::other("timeout", "slow").kind, ErrorKind::Timeout);
        assert_eq!(
            TaskError::other("quota", "exhausted").kind,
            ErrorKind::Other("quota".to_string())
        );
    }

    #[test]
    fn test_transient_and_fatal_are_disjoint() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::Timeout.is_fatal());
        assert!(ErrorKind::MissingHandler.is_fatal());
        assert!(!ErrorKind::Other("x".into()).is_transient());
        assert!(!ErrorKind::Other("x".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = TaskError::missing_handler("lint");
        assert_eq!(
            err.to_string(),
            "missing_handler error: no handler registered for task 'lint'"
        );
    }
}
