//! Retry execution for standalone async operations
//!
//! [`RetryHandler`] drives an operation through a [`RetryPolicy`], sleeping for
//! the computed backoff between attempts, and keeps a bounded history of
//! outcomes per operation id for statistics.

use crate::constants::history::RETRY_HISTORY_PER_OPERATION;
use crate::models::RetryPolicy;
use crate::orchestration::backoff_calculator::{compute_delay, should_retry};
use crate::orchestration::errors::TaskError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one `execute_with_retry` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub operation_id: String,
    pub attempts: u32,
    pub total_delay: Duration,
    pub succeeded: bool,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub average_attempts: f64,
    pub average_total_delay: Duration,
    pub success_rate: f64,
}

#[derive(Debug)]
pub struct RetryHandler {
    history: Mutex<HashMap<String, VecDeque<RetryRecord>>>,
    max_history: usize,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryHandler {
    pub fn new() -> Self {
        Self::with_history_limit(RETRY_HISTORY_PER_OPERATION)
    }

    pub fn with_history_limit(max_history: usize) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            max_history: max_history.max(1),
        }
    }

    /// Run `operation` until it succeeds or the policy stops retrying
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, TaskError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let started_at = Utc::now();
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation_id, attempt, "Operation succeeded after retry");
                    }
                    self.record(RetryRecord {
                        operation_id: operation_id.to_string(),
                        attempts: attempt,
                        total_delay,
                        succeeded: true,
                        last_error: None,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return Ok(value);
                }
                Err(error) if should_retry(policy, &error, attempt) => {
                    let delay = compute_delay(policy, attempt);
                    warn!(
                        operation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    total_delay += delay;
                }
                Err(error) => {
                    self.record(RetryRecord {
                        operation_id: operation_id.to_string(),
                        attempts: attempt,
                        total_delay,
                        succeeded: false,
                        last_error: Some(error.to_string()),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return Err(error);
                }
            }
        }
    }

    fn record(&self, record: RetryRecord) {
        let mut history = self.history.lock();
        let entries = history.entry(record.operation_id.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.max_history {
            entries.pop_front();
        }
    }

    pub fn history(&self, operation_id: &str) -> Vec<RetryRecord> {
        self.history
            .lock()
            .get(operation_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate statistics for one operation id, or for all of them
    pub fn retry_stats(&self, operation_id: Option<&str>) -> RetryStats {
        let history = self.history.lock();
        let records: Vec<&RetryRecord> = match operation_id {
            Some(id) => history.get(id).into_iter().flatten().collect(),
            None => history.values().flatten().collect(),
        };
        if records.is_empty() {
            return RetryStats::default();
        }

        let total = records.len();
        let successful = records.iter().filter(|r| r.succeeded).count();
        let attempts: u64 = records.iter().map(|r| u64::from(r.attempts)).sum();
        let delay: Duration = records.iter().map(|r| r.total_delay).sum();
        RetryStats {
            total_operations: total,
            successful_operations: successful,
            failed_operations: total - successful,
            average_attempts: attempts as f64 / total as f64,
            average_total_delay: delay / total as u32,
            success_rate: successful as f64 / total as f64,
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let handler = RetryHandler::new();
        let calls = AtomicU32::new(0);
        let result = handler
            .execute_with_retry("fetch", &fast_policy(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TaskError::connection("reset"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = handler.retry_stats(Some("fetch"));
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.successful_operations, 1);
        assert_eq!(stats.average_attempts, 3.0);
        assert!(stats.average_total_delay >= Duration::from_millis(6));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let handler = RetryHandler::new();
        let result: Result<(), TaskError> = handler
            .execute_with_retry("validate", &fast_policy(), |_| async {
                Err(TaskError::validation("bad input"))
            })
            .await;
        assert!(result.is_err());
        let record = &handler.history("validate")[0];
        assert_eq!(record.attempts, 1);
        assert!(!record.succeeded);
    }

    #[tokio::test]
    async fn test_gives_up_at_max_attempts() {
        let handler = RetryHandler::new();
        let result: Result<(), TaskError> = handler
            .execute_with_retry("flaky", &fast_policy(), |_| async {
                Err(TaskError::timeout("slow"))
            })
            .await;
        assert_eq!(result, Err(TaskError::timeout("slow")));
        assert_eq!(handler.history("flaky")[0].attempts, 3);
        assert_eq!(handler.retry_stats(None).success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let handler = RetryHandler::with_history_limit(2);
        for _ in 0..5 {
            let _ = handler
                .execute_with_retry("op", &fast_policy(), |_| async { Ok::<_, TaskError>(()) })
                .await;
        }
        assert_eq!(handler.history("op").len(), 2);
    }
}
