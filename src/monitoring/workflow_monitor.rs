//! # Workflow Monitor
//!
//! Collects lifecycle metrics for workflows and their tasks and aggregates them
//! into performance summaries.
//!
//! ## Overview
//!
//! Every recording call is a short synchronous write into an in-memory store, so
//! the orchestrator can call them inline without ever waiting on aggregation.
//! Summaries are computed on demand and cached per window for
//! `summary_cache_ttl_seconds`; the cache is dropped whenever a workflow
//! finishes. Finished workflows older than the retention window are removed by
//! [`cleanup_old_metrics`](WorkflowMonitor::cleanup_old_metrics), which the
//! orchestrator's periodic cleanup calls.

use super::types::{
    HealthStatus, MonitorEvent, PerformanceMetrics, SystemHealth, TaskMetrics, WorkflowMetrics,
};
use crate::config::MonitoringConfig;
use crate::constants::events;
use crate::constants::monitoring::{DEGRADED_ERROR_RATE, STEP_DURATION_SAMPLES};
use crate::models::WorkflowId;
use crate::state_machine::{TaskStatus, WorkflowStatus};
use crate::utils::cutoff_before;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct MonitorStore {
    workflows: HashMap<WorkflowId, WorkflowMetrics>,
    /// Recent durations per step name, in milliseconds
    step_durations: HashMap<String, VecDeque<u64>>,
}

#[derive(Debug, Clone)]
struct CachedSummary {
    expires_at: Instant,
    metrics: PerformanceMetrics,
}

/// In-memory metrics collector
#[derive(Debug)]
pub struct WorkflowMonitor {
    config: MonitoringConfig,
    store: RwLock<MonitorStore>,
    summary_cache: Mutex<HashMap<u64, CachedSummary>>,
    started_at: Instant,
}

impl Default for WorkflowMonitor {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

impl WorkflowMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            store: RwLock::new(MonitorStore::default()),
            summary_cache: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    fn push_event(&self, metrics: &mut WorkflowMetrics, event: &str, task_name: Option<&str>, details: Value) {
        metrics.events.push_back(MonitorEvent {
            event: event.to_string(),
            timestamp: Utc::now(),
            task_name: task_name.map(str::to_string),
            details,
        });
        while metrics.events.len() > self.config.max_events_per_workflow {
            metrics.events.pop_front();
        }
    }

    fn invalidate_cache(&self) {
        self.summary_cache.lock().clear();
    }

    pub fn record_workflow_start(&self, workflow_id: WorkflowId, review_id: &str, config_name: &str) {
        let mut metrics = WorkflowMetrics {
            workflow_id,
            review_id: review_id.to_string(),
            config_name: config_name.to_string(),
            status: WorkflowStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: None,
            task_metrics: BTreeMap::new(),
            error_count: 0,
            errors_by_kind: HashMap::new(),
            retry_count: 0,
            events: VecDeque::new(),
        };
        self.push_event(
            &mut metrics,
            events::WORKFLOW_STARTED,
            None,
            json!({ "review_id": review_id, "config_name": config_name }),
        );
        self.store.write().workflows.insert(workflow_id, metrics);
        debug!(workflow_id = %workflow_id, "Recorded workflow start");
    }

    /// Reopen a finished workflow's metrics after a whole-workflow retry
    pub fn record_workflow_restart(&self, workflow_id: WorkflowId) {
        let mut store = self.store.write();
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        metrics.status = WorkflowStatus::Running;
        metrics.end_time = None;
        metrics.total_duration_ms = None;
        self.push_event(metrics, events::WORKFLOW_RESTARTED, None, Value::Null);
        drop(store);
        self.invalidate_cache();
    }

    pub fn record_task_start(&self, workflow_id: WorkflowId, task_name: &str, task_id: Uuid, attempt: u32) {
        let mut store = self.store.write();
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        let now = Utc::now();
        let task = metrics
            .task_metrics
            .entry(task_name.to_string())
            .or_insert_with(|| TaskMetrics {
                task_id,
                status: TaskStatus::Pending,
                start_time: now,
                end_time: None,
                duration_ms: None,
                attempts: 0,
                retry_count: 0,
                error_message: None,
            });
        task.task_id = task_id;
        task.status = TaskStatus::Running;
        task.start_time = now;
        task.end_time = None;
        task.duration_ms = None;
        task.attempts = task.attempts.max(attempt);
        self.push_event(
            metrics,
            events::TASK_STARTED,
            Some(task_name),
            json!({ "task_id": task_id, "attempt": attempt }),
        );
    }

    /// Close the latest attempt of a task; returns its duration
    fn finish_task(
        store: &mut MonitorStore,
        workflow_id: WorkflowId,
        task_name: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Option<u64> {
        let metrics = store.workflows.get_mut(&workflow_id)?;
        let task = metrics.task_metrics.get_mut(task_name)?;
        let now = Utc::now();
        let duration = elapsed_ms(task.start_time, now);
        task.status = status;
        task.end_time = Some(now);
        task.duration_ms = Some(duration);
        if let Some(message) = error_message {
            task.error_message = Some(message.to_string());
        }

        let samples = store.step_durations.entry(task_name.to_string()).or_default();
        samples.push_back(duration);
        while samples.len() > STEP_DURATION_SAMPLES {
            samples.pop_front();
        }
        Some(duration)
    }

    /// Record the final outcome of a task attempt
    pub fn record_task_completion(
        &self,
        workflow_id: WorkflowId,
        task_name: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) {
        let mut store = self.store.write();
        let duration = Self::finish_task(&mut store, workflow_id, task_name, status, error_message);
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        let event = match status {
            TaskStatus::Completed => events::TASK_COMPLETED,
            TaskStatus::Cancelled => events::TASK_CANCELLED,
            _ => events::TASK_FAILED,
        };
        self.push_event(
            metrics,
            event,
            Some(task_name),
            json!({ "status": status, "duration_ms": duration, "error_message": error_message }),
        );
    }

    /// Record a task that failed but was allowed to count as done
    pub fn record_task_skipped(&self, workflow_id: WorkflowId, task_name: &str, reason: &str) {
        let mut store = self.store.write();
        let duration = Self::finish_task(
            &mut store,
            workflow_id,
            task_name,
            TaskStatus::Completed,
            Some(reason),
        );
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        self.push_event(
            metrics,
            events::TASK_SKIPPED,
            Some(task_name),
            json!({ "duration_ms": duration, "reason": reason }),
        );
    }

    pub fn record_task_retry(&self, workflow_id: WorkflowId, task_name: &str, attempt: u32, delay: Duration) {
        let mut store = self.store.write();
        Self::finish_task(&mut store, workflow_id, task_name, TaskStatus::Retrying, None);
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        metrics.retry_count += 1;
        if let Some(task) = metrics.task_metrics.get_mut(task_name) {
            task.retry_count += 1;
        }
        self.push_event(
            metrics,
            events::TASK_RETRY_SCHEDULED,
            Some(task_name),
            json!({ "failed_attempt": attempt, "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) }),
        );
    }

    pub fn record_error(&self, workflow_id: WorkflowId, task_name: Option<&str>, kind: &str, message: &str) {
        let mut store = self.store.write();
        let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
            return;
        };
        metrics.error_count += 1;
        *metrics.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        if let Some(task) = task_name.and_then(|name| metrics.task_metrics.get_mut(name)) {
            task.error_message = Some(message.to_string());
        }
        self.push_event(
            metrics,
            events::ERROR_RECORDED,
            task_name,
            json!({ "kind": kind, "error_message": message }),
        );
        warn!(
            workflow_id = %workflow_id,
            task_name = task_name,
            error_kind = kind,
            error = message,
            "Recorded workflow error"
        );
    }

    /// Stamp the end of a workflow; drops cached summaries
    pub fn record_workflow_completion(&self, workflow_id: WorkflowId, status: WorkflowStatus) {
        {
            let mut store = self.store.write();
            let Some(metrics) = store.workflows.get_mut(&workflow_id) else {
                return;
            };
            let now = Utc::now();
            metrics.status = status;
            metrics.end_time = Some(now);
            metrics.total_duration_ms = Some(elapsed_ms(metrics.start_time, now));
            let event = match status {
                WorkflowStatus::Completed => events::WORKFLOW_COMPLETED,
                WorkflowStatus::Cancelled => events::WORKFLOW_CANCELLED,
                _ => events::WORKFLOW_FAILED,
            };
            let duration = metrics.total_duration_ms;
            self.push_event(
                metrics,
                event,
                None,
                json!({ "final_status": status, "duration_ms": duration }),
            );
            info!(
                workflow_id = %workflow_id,
                status = %status,
                duration_ms = duration,
                "Recorded workflow completion"
            );
        }
        self.invalidate_cache();
    }

    pub fn workflow_metrics(&self, workflow_id: WorkflowId) -> Option<WorkflowMetrics> {
        self.store.read().workflows.get(&workflow_id).cloned()
    }

    /// Workflows started and not yet finished, oldest first
    pub fn active_workflows(&self) -> Vec<WorkflowId> {
        let store = self.store.read();
        let mut active: Vec<&WorkflowMetrics> =
            store.workflows.values().filter(|m| m.is_active()).collect();
        active.sort_by_key(|m| m.start_time);
        active.into_iter().map(|m| m.workflow_id).collect()
    }

    /// Aggregate over workflows started within `window` (default: the retention window)
    pub fn performance_summary(&self, window: Option<Duration>) -> PerformanceMetrics {
        let window = window.unwrap_or_else(|| self.config.retention());
        let key = window.as_secs();
        let now = Instant::now();

        if let Some(cached) = self.summary_cache.lock().get(&key) {
            if cached.expires_at > now {
                return cached.metrics.clone();
            }
        }

        let metrics = self.compute_summary(window);
        self.summary_cache.lock().insert(
            key,
            CachedSummary {
                expires_at: now + self.config.summary_cache_ttl(),
                metrics: metrics.clone(),
            },
        );
        metrics
    }

    fn compute_summary(&self, window: Duration) -> PerformanceMetrics {
        let now = Utc::now();
        let cutoff = cutoff_before(now, window);

        let store = self.store.read();
        let in_window: Vec<&WorkflowMetrics> = store
            .workflows
            .values()
            .filter(|m| m.start_time >= cutoff)
            .collect();

        let count_status =
            |status: WorkflowStatus| in_window.iter().filter(|m| m.status == status).count();
        let completed = count_status(WorkflowStatus::Completed);
        let failed = count_status(WorkflowStatus::Failed);
        let cancelled = count_status(WorkflowStatus::Cancelled);
        let finished = completed + failed + cancelled;

        let durations: Vec<f64> = in_window
            .iter()
            .filter_map(|m| m.total_duration_ms)
            .map(|ms| ms as f64)
            .collect();

        let total = in_window.len();
        let task_count: usize = in_window.iter().map(|m| m.task_metrics.len()).sum();
        let attempts: u64 = in_window.iter().map(|m| m.task_attempts()).sum();
        let errors: u64 = in_window.iter().map(|m| m.error_count).sum();
        let mut errors_by_kind: HashMap<String, u64> = HashMap::new();
        for metrics in &in_window {
            for (kind, count) in &metrics.errors_by_kind {
                *errors_by_kind.entry(kind.clone()).or_insert(0) += count;
            }
        }

        let step_average_durations_ms = store
            .step_durations
            .iter()
            .filter_map(|(step, samples)| {
                average(samples.iter().map(|ms| *ms as f64)).map(|avg| (step.clone(), avg))
            })
            .collect();

        let window_hours = window.as_secs_f64() / 3_600.0;

        PerformanceMetrics {
            window_seconds: window.as_secs(),
            total_workflows: total,
            completed_workflows: completed,
            failed_workflows: failed,
            cancelled_workflows: cancelled,
            active_workflows: store.workflows.values().filter(|m| m.is_active()).count(),
            success_rate: if finished == 0 {
                1.0
            } else {
                completed as f64 / finished as f64
            },
            average_duration_ms: average(durations.iter().copied()).unwrap_or(0.0),
            min_duration_ms: durations.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_duration_ms: durations.iter().copied().reduce(f64::max).unwrap_or(0.0),
            avg_tasks_per_workflow: if total == 0 {
                0.0
            } else {
                task_count as f64 / total as f64
            },
            throughput_per_hour: if window_hours > 0.0 {
                completed as f64 / window_hours
            } else {
                0.0
            },
            error_rate: if attempts == 0 {
                0.0
            } else {
                errors as f64 / attempts as f64
            },
            errors_by_kind,
            step_average_durations_ms,
            generated_at: now,
        }
    }

    /// Health derived from the retention-window summary
    pub fn system_health(&self) -> SystemHealth {
        let summary = self.performance_summary(None);
        SystemHealth {
            status: if summary.error_rate < DEGRADED_ERROR_RATE {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            active_workflows: summary.active_workflows,
            error_rate: summary.error_rate,
            average_completion_ms: summary.average_duration_ms,
            throughput_per_hour: summary.throughput_per_hour,
            queue_depth: 0,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Drop finished workflows that started at or before `now - retention`
    ///
    /// Returns the number of workflows removed. Active workflows are kept.
    pub fn cleanup_old_metrics(&self, retention: Duration) -> usize {
        let cutoff = cutoff_before(Utc::now(), retention);

        let removed = {
            let mut store = self.store.write();
            let before = store.workflows.len();
            store
                .workflows
                .retain(|_, m| m.is_active() || m.start_time > cutoff);
            before - store.workflows.len()
        };
        if removed > 0 {
            self.invalidate_cache();
            info!(removed, "Cleaned up old workflow metrics");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.read().workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
