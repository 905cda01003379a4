//! # System Constants
//!
//! Event names, defaults, and limits that define the operational boundaries of
//! the review orchestrator.

use std::time::Duration;

/// Event names recorded in per-workflow event logs
pub mod events {
    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_RESTARTED: &str = "workflow.restarted";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";

    // Task lifecycle events
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_CANCELLED: &str = "task.cancelled";

    pub const ERROR_RECORDED: &str = "error.recorded";
}

/// Defaults for [`crate::models::RetryPolicy`]
pub mod retry_defaults {
    use super::Duration;

    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const MAX_DELAY: Duration = Duration::from_secs(300);
}

/// Defaults for workflow and task definitions
pub mod workflow_defaults {
    use super::Duration;

    pub const MAX_CONCURRENT_TASKS: usize = 5;
    pub const TASK_TIMEOUT: Duration = Duration::from_secs(300);
    pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
    pub const INITIAL_STEP: &str = "start";
}

/// Reserved keys inside a workflow's step data
pub mod step_data {
    /// Per-task warnings recorded when a non-critical task is skipped
    pub const WARNINGS_KEY: &str = "_warnings";
}

/// Bounds on user supplied task parameters
pub mod limits {
    pub const MAX_PARAMETER_DEPTH: usize = 10;
    pub const MAX_PARAMETER_BYTES: usize = 1024 * 1024;
    pub const MAX_TASK_NAME_LENGTH: usize = 128;
}

/// Monitoring thresholds
pub mod monitoring {
    /// Error rate at or above which the system reports itself as degraded
    pub const DEGRADED_ERROR_RATE: f64 = 0.05;
    pub const HEALTHY: &str = "healthy";
    pub const DEGRADED: &str = "degraded";
    /// Per-step duration samples kept for averages
    pub const STEP_DURATION_SAMPLES: usize = 100;
}

/// Bounded history sizes
pub mod history {
    pub const RETRY_HISTORY_PER_OPERATION: usize = 100;
    pub const STATE_EVENT_CHANNEL_CAPACITY: usize = 1024;
}
