//! # Monitoring
//!
//! Workflow and task metrics, performance summaries and system health.

pub mod types;
pub mod workflow_monitor;

pub use types::{
    HealthStatus, MonitorEvent, PerformanceMetrics, SystemHealth, TaskMetrics, WorkflowMetrics,
};
pub use workflow_monitor::WorkflowMonitor;
