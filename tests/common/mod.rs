//! Shared helpers for integration tests

#![allow(dead_code)]

pub mod strategies;

use parking_lot::Mutex;
use review_orchestrator::config::{OrchestratorConfig, WorkerPoolConfig};
use review_orchestrator::models::{RetryPolicy, TaskDefinition, WorkflowConfig};
use review_orchestrator::WorkflowOrchestrator;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for a test workflow to finish
pub const WAIT: Duration = Duration::from_secs(5);

/// Configuration with short polling so tests react quickly
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_pool: WorkerPoolConfig {
            worker_count: 4,
            idle_poll_interval_ms: 5,
            max_queue_size: None,
            shutdown_timeout_ms: 500,
        },
        ..OrchestratorConfig::default()
    }
}

/// Orchestrator built from [`fast_config`] with its workers running
pub async fn running_orchestrator() -> WorkflowOrchestrator {
    let orchestrator = WorkflowOrchestrator::new(fast_config()).expect("valid test config");
    orchestrator.start().await;
    orchestrator
}

/// Retry policy with millisecond delays
pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(50))
}

/// A -> (B, C) -> D
pub fn diamond_workflow() -> WorkflowConfig {
    WorkflowConfig::new("diamond-review")
        .with_task(TaskDefinition::new("fetch_diff"))
        .with_task(TaskDefinition::new("lint").depends_on(["fetch_diff"]))
        .with_task(TaskDefinition::new("security_scan").depends_on(["fetch_diff"]))
        .with_task(TaskDefinition::new("summarize").depends_on(["lint", "security_scan"]))
}

/// Start and end instants of handler executions, by task name
#[derive(Debug, Default, Clone)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<(String, Instant, Option<Instant>)>>>,
}

impl ExecutionLog {
    pub fn started(&self, task: &str) -> usize {
        let mut entries = self.entries.lock();
        entries.push((task.to_string(), Instant::now(), None));
        entries.len() - 1
    }

    pub fn finished(&self, index: usize) {
        if let Some(entry) = self.entries.lock().get_mut(index) {
            entry.2 = Some(Instant::now());
        }
    }

    pub fn calls(&self, task: &str) -> usize {
        self.entries.lock().iter().filter(|(name, _, _)| name == task).count()
    }

    pub fn span(&self, task: &str) -> Option<(Instant, Instant)> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|(name, _, _)| name == task)
            .and_then(|(_, start, end)| end.map(|end| (*start, end)))
    }
}
