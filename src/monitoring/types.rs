//! Metric records exposed by the [`WorkflowMonitor`](super::WorkflowMonitor).

use crate::constants::monitoring::{DEGRADED, HEALTHY};
use crate::models::WorkflowId;
use crate::state_machine::{TaskStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

/// One entry in a workflow's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub task_name: Option<String>,
    pub details: Value,
}

/// Timing and outcome of one task within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Start of the latest attempt
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Duration of the latest attempt in milliseconds
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

/// Everything recorded about one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: WorkflowId,
    pub review_id: String,
    pub config_name: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub task_metrics: BTreeMap<String, TaskMetrics>,
    pub error_count: u64,
    pub errors_by_kind: HashMap<String, u64>,
    pub retry_count: u32,
    /// Most recent events, oldest first
    pub events: VecDeque<MonitorEvent>,
}

impl WorkflowMetrics {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Attempts started across all tasks
    pub fn task_attempts(&self) -> u64 {
        self.task_metrics.values().map(|t| u64::from(t.attempts)).sum()
    }
}

/// Aggregate over workflows started within a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub window_seconds: u64,
    pub total_workflows: usize,
    pub completed_workflows: usize,
    pub failed_workflows: usize,
    pub cancelled_workflows: usize,
    /// Workflows still running system-wide, regardless of window
    pub active_workflows: usize,
    /// Completed over finished workflows; 1.0 when nothing has finished
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub avg_tasks_per_workflow: f64,
    /// Completed workflows per hour of window
    pub throughput_per_hour: f64,
    /// Errors over task attempts
    pub error_rate: f64,
    pub errors_by_kind: HashMap<String, u64>,
    /// Average recent duration per step name, in milliseconds
    pub step_average_durations_ms: BTreeMap<String, f64>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "{HEALTHY}"),
            Self::Degraded => write!(f, "{DEGRADED}"),
        }
    }
}

/// Health indicators for dashboards and health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub active_workflows: usize,
    pub error_rate: f64,
    pub average_completion_ms: f64,
    pub throughput_per_hour: f64,
    /// Items waiting in the task queue; filled in by the orchestrator
    pub queue_depth: usize,
    pub uptime_seconds: u64,
}
