//! # Workflow Coordinator
//!
//! Top-level orchestration engine that drives review workflows from submission
//! to a finished status.
//!
//! ## Architecture: Main Orchestration Engine
//!
//! The [`WorkflowOrchestrator`] owns the shared components and reacts to task
//! outcomes reported by the [`WorkerPool`]:
//!
//! ```text
//! start_workflow ──> PriorityTaskQueue ──> WorkerPool ──> TaskHandler
//!        │                   ▲                 │
//!        ▼                   │                 ▼
//! WorkflowStateManager <── OrchestratorCore (TaskLifecycle) ──> WorkflowMonitor
//!                                   │
//!                                   ▼
//!                            ErrorClassifier
//! ```
//!
//! ## Key Responsibilities
//!
//! - **Admission**: validate workflow definitions and enqueue their root tasks
//! - **Dependency release**: enqueue dependents once all of their dependencies completed
//! - **Recovery**: classify failed attempts into retry, skip, or fail
//! - **Control**: cancel running workflows and restart failed ones
//! - **Deadlines**: fail workflows that exceed their overall timeout
//! - **Observability**: feed the [`WorkflowMonitor`] and structured logs
//! - **Retention**: periodically evict archived and long-failed workflows
//!
//! ## Usage
//!
//! ```rust,no_run
//! use review_orchestrator::models::{TaskDefinition, WorkflowConfig};
//! use review_orchestrator::orchestration::WorkflowOrchestrator;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = WorkflowOrchestrator::builder().build()?;
//! orchestrator.registry().register_fn("lint", |_params, _ctx| async move {
//!     Ok(json!({ "warnings": 0 }))
//! });
//! orchestrator.start().await;
//!
//! let workflow = WorkflowConfig::new("quick-review").with_task(TaskDefinition::new("lint"));
//! let workflow_id = orchestrator.start_workflow(workflow, "review-42").await?;
//! let state = orchestrator
//!     .wait_for_completion(workflow_id, Duration::from_secs(30))
//!     .await?;
//! println!("finished as {}", state.status);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::OrchestratorConfig;
use crate::constants::workflow_defaults::INITIAL_STEP;
use crate::error::{OrchestratorError, Result};
use crate::logging::{log_task_operation, log_workflow_operation};
use crate::models::{TaskDefinition, TaskItem, WorkflowConfig, WorkflowId, WorkflowState};
use crate::monitoring::{PerformanceMetrics, SystemHealth, WorkflowMetrics, WorkflowMonitor};
use crate::orchestration::error_classifier::{
    ErrorClassifier, ErrorContext, ErrorStats, RecoveryAction, StandardErrorClassifier,
};
use crate::orchestration::errors::{ErrorKind, TaskError};
use crate::orchestration::state_manager::{StateChangeEvent, WorkflowStateManager};
use crate::orchestration::task_queue::{PriorityTaskQueue, QueueError, QueueStats};
use crate::orchestration::worker_pool::{TaskLifecycle, WorkerPool};
use crate::persistence::StatePersistence;
use crate::registry::{TaskContext, TaskHandler, TaskHandlerRegistry};
use crate::state_machine::{StateMachineError, TaskStatus, WorkflowStatus};
use crate::utils::cutoff_before;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Interval between status checks in [`WorkflowOrchestrator::wait_for_completion`]
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cancellation scope of one run of a workflow
///
/// A restart opens a new epoch so that outcomes reported by attempts of the
/// previous run are recognised as stale.
struct Epoch {
    number: u64,
    token: CancellationToken,
}

/// In-memory bookkeeping for a workflow that has not reached a terminal status
struct WorkflowRuntime {
    config: WorkflowConfig,
    review_id: String,
    definitions: HashMap<String, Arc<TaskDefinition>>,
    epoch: Mutex<Epoch>,
    /// Task names with a live item: queued, running, or waiting out a retry delay
    scheduled: Mutex<HashSet<String>>,
    /// Running attempts and the epoch they started in
    in_flight: Mutex<HashMap<Uuid, u64>>,
}

impl WorkflowRuntime {
    fn new(config: WorkflowConfig, review_id: &str) -> Self {
        let definitions = config
            .tasks
            .iter()
            .map(|task| (task.name.clone(), Arc::new(task.clone())))
            .collect();
        Self {
            config,
            review_id: review_id.to_string(),
            definitions,
            epoch: Mutex::new(Epoch {
                number: 0,
                token: CancellationToken::new(),
            }),
            scheduled: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn current_epoch(&self) -> (u64, CancellationToken) {
        let epoch = self.epoch.lock();
        (epoch.number, epoch.token.clone())
    }

    fn epoch_number(&self) -> u64 {
        self.epoch.lock().number
    }

    fn token(&self) -> CancellationToken {
        self.epoch.lock().token.clone()
    }

    fn cancel(&self) {
        self.epoch.lock().token.cancel();
    }

    fn next_epoch(&self) {
        let mut epoch = self.epoch.lock();
        epoch.token.cancel();
        epoch.number += 1;
        epoch.token = CancellationToken::new();
    }

    fn begin_attempt(&self, item_id: Uuid, epoch: u64) {
        self.in_flight.lock().insert(item_id, epoch);
    }

    /// Whether a finished attempt belongs to the current, uncancelled run
    fn finish_attempt(&self, item_id: Uuid) -> bool {
        let started_in = self.in_flight.lock().remove(&item_id);
        let epoch = self.epoch.lock();
        started_in == Some(epoch.number) && !epoch.token.is_cancelled()
    }

    /// Claim every task whose dependencies are all in `completed`
    fn claim_ready(&self, completed: &BTreeSet<String>) -> Vec<Arc<TaskDefinition>> {
        let mut scheduled = self.scheduled.lock();
        self.config
            .tasks
            .iter()
            .filter(|task| !completed.contains(&task.name))
            .filter(|task| task.dependencies_satisfied(|dep| completed.contains(dep)))
            .filter(|task| scheduled.insert(task.name.clone()))
            .filter_map(|task| self.definitions.get(&task.name).cloned())
            .collect()
    }

    fn release(&self, task_name: &str) {
        self.scheduled.lock().remove(task_name);
    }

    fn clear_scheduled(&self) {
        self.scheduled.lock().clear();
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        self.config
            .tasks
            .iter()
            .all(|task| state.is_step_completed(&task.name))
    }
}

/// How a step ended when it counts towards workflow progress
enum StepOutcome {
    Completed(Value),
    Skipped(String),
}

/// Shared orchestration state; also the [`TaskLifecycle`] of the worker pool
struct OrchestratorCore {
    this: Weak<OrchestratorCore>,
    config: OrchestratorConfig,
    state_manager: Arc<WorkflowStateManager>,
    queue: Arc<PriorityTaskQueue>,
    registry: Arc<TaskHandlerRegistry>,
    classifier: Arc<dyn ErrorClassifier>,
    monitor: Arc<WorkflowMonitor>,
    runtimes: DashMap<WorkflowId, Arc<WorkflowRuntime>>,
}

fn state_error(workflow_id: WorkflowId) -> impl Fn(StateMachineError) -> OrchestratorError {
    move |error| OrchestratorError::from_state_machine(workflow_id, error)
}

impl OrchestratorCore {
    fn runtime(&self, workflow_id: WorkflowId) -> Option<Arc<WorkflowRuntime>> {
        self.runtimes.get(&workflow_id).map(|r| Arc::clone(r.value()))
    }

    async fn start_workflow(&self, config: WorkflowConfig, review_id: &str) -> Result<WorkflowId> {
        config.validate()?;
        let limit = self.config.limits.max_tasks_per_workflow;
        if config.tasks.len() > limit {
            return Err(OrchestratorError::InvalidWorkflowConfig(format!(
                "workflow '{}' defines {} tasks, more than the limit of {limit}",
                config.name,
                config.tasks.len()
            )));
        }

        let state = self
            .state_manager
            .create_workflow(review_id, &config.name, Some(INITIAL_STEP.to_string()))
            .await?;
        let workflow_id = state.workflow_id;
        let runtime = Arc::new(WorkflowRuntime::new(config, review_id));
        self.runtimes.insert(workflow_id, Arc::clone(&runtime));
        self.queue.register_workflow(
            workflow_id,
            runtime.config.max_concurrent_tasks,
            std::iter::empty::<String>(),
        );

        if let Err(error) = self
            .state_manager
            .transition(workflow_id, WorkflowStatus::Running)
            .await
        {
            self.runtimes.remove(&workflow_id);
            self.queue.remove_workflow(workflow_id);
            return Err(error);
        }

        self.monitor
            .record_workflow_start(workflow_id, review_id, &runtime.config.name);
        self.spawn_watchdog(workflow_id, &runtime);
        let scheduled = self
            .schedule_ready(workflow_id, &runtime, &BTreeSet::new())
            .await;

        log_workflow_operation(
            "start_workflow",
            Some(workflow_id),
            Some(review_id),
            "running",
            Some(&format!(
                "config={} tasks={} roots={scheduled}",
                runtime.config.name,
                runtime.config.tasks.len()
            )),
        );
        Ok(workflow_id)
    }

    /// Enqueue every unclaimed task whose dependencies are satisfied
    async fn schedule_ready(
        &self,
        workflow_id: WorkflowId,
        runtime: &Arc<WorkflowRuntime>,
        completed: &BTreeSet<String>,
    ) -> usize {
        let mut scheduled = 0;
        for definition in runtime.claim_ready(completed) {
            let item = TaskItem::new(workflow_id, Arc::clone(&definition));
            match self.queue.enqueue(item) {
                Ok(()) => scheduled += 1,
                Err(QueueError::WorkflowCancelled(_)) => {
                    runtime.release(&definition.name);
                    break;
                }
                Err(error) => {
                    runtime.release(&definition.name);
                    let message = format!("failed to enqueue task '{}': {error}", definition.name);
                    self.fail_workflow(workflow_id, runtime, None, &message).await;
                    break;
                }
            }
        }
        scheduled
    }

    fn spawn_watchdog(&self, workflow_id: WorkflowId, runtime: &Arc<WorkflowRuntime>) {
        let Some(timeout) = runtime.config.overall_timeout else {
            return;
        };
        let core = self.this.clone();
        let runtime = Arc::clone(runtime);
        let token = runtime.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let Some(core) = core.upgrade() else { return };
                    let message = format!(
                        "workflow exceeded overall timeout of {}ms",
                        timeout.as_millis()
                    );
                    core.monitor
                        .record_error(workflow_id, None, ErrorKind::Timeout.name(), &message);
                    core.fail_workflow(workflow_id, &runtime, None, &message).await;
                }
            }
        });
    }

    fn schedule_retry(&self, runtime: Arc<WorkflowRuntime>, item: TaskItem, delay: Duration) {
        let core = self.this.clone();
        let (epoch, token) = runtime.current_epoch();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(workflow_id = %item.workflow_id, task_name = item.name(), "Dropped pending retry");
                }
                _ = tokio::time::sleep(delay) => {
                    let Some(core) = core.upgrade() else { return };
                    let workflow_id = item.workflow_id;
                    let task_name = item.name().to_string();
                    match core.queue.enqueue(item) {
                        Ok(()) => {}
                        Err(QueueError::WorkflowCancelled(_)) => {}
                        Err(error) if runtime.epoch_number() == epoch => {
                            let message = format!("failed to re-enqueue task '{task_name}': {error}");
                            core.fail_workflow(workflow_id, &runtime, Some(&task_name), &message)
                                .await;
                        }
                        Err(_) => {}
                    }
                }
            }
        });
    }

    /// Record progress for a step and release whatever it unblocks
    async fn apply_step_outcome(
        &self,
        runtime: &Arc<WorkflowRuntime>,
        item: &TaskItem,
        outcome: StepOutcome,
    ) {
        let workflow_id = item.workflow_id;
        let task_name = item.name();
        let skip_reason = match &outcome {
            StepOutcome::Skipped(reason) => Some(reason.clone()),
            StepOutcome::Completed(_) => None,
        };
        let sm = state_error(workflow_id);
        let tracked = Arc::clone(runtime);

        let applied = self
            .state_manager
            .with_workflow(workflow_id, move |state| {
                if state.status != WorkflowStatus::Running {
                    return Ok(None);
                }
                match outcome {
                    StepOutcome::Completed(result) => state.advance_step(task_name, Some(result)),
                    StepOutcome::Skipped(reason) => state.skip_step(task_name, &reason),
                }
                .map_err(&sm)?;
                let finished = tracked.is_complete(state);
                if finished {
                    state.transition_to(WorkflowStatus::Completed).map_err(&sm)?;
                }
                Ok(Some((finished, state.completed_steps.clone())))
            })
            .await;

        let (finished, completed) = match applied {
            Ok(Some(progress)) => progress,
            Ok(None) => {
                debug!(workflow_id = %workflow_id, task_name, "Discarded outcome for workflow that is no longer running");
                return;
            }
            Err(error) => {
                warn!(workflow_id = %workflow_id, task_name, error = %error, "Failed to record step outcome");
                return;
            }
        };

        match &skip_reason {
            Some(reason) => self.monitor.record_task_skipped(workflow_id, task_name, reason),
            None => self
                .monitor
                .record_task_completion(workflow_id, task_name, TaskStatus::Completed, None),
        }
        log_task_operation(
            "complete_task",
            workflow_id,
            task_name,
            Some(item.attempt_number()),
            if skip_reason.is_some() { "skipped" } else { "completed" },
            skip_reason.as_deref(),
        );

        runtime.release(task_name);
        self.queue.mark_step_completed(workflow_id, task_name);

        if finished {
            self.finalize(workflow_id, WorkflowStatus::Completed).await;
        } else {
            self.schedule_ready(workflow_id, runtime, &completed).await;
        }
    }

    /// Move a running or restarting workflow to `failed` and stop its tasks
    async fn fail_workflow(
        &self,
        workflow_id: WorkflowId,
        runtime: &WorkflowRuntime,
        step: Option<&str>,
        message: &str,
    ) -> bool {
        let sm = state_error(workflow_id);
        let failed = self
            .state_manager
            .with_workflow(workflow_id, |state| {
                if !matches!(state.status, WorkflowStatus::Running | WorkflowStatus::Retrying) {
                    return Ok(false);
                }
                match step {
                    Some(step) => state.mark_step_failed(step, message),
                    None => state.set_error_message(Some(message.to_string())),
                }
                .map_err(&sm)?;
                state.transition_to(WorkflowStatus::Failed).map_err(&sm)?;
                Ok(true)
            })
            .await;

        match failed {
            Ok(true) => {}
            Ok(false) => return false,
            Err(error) => {
                warn!(workflow_id = %workflow_id, error = %error, "Failed to mark workflow as failed");
                return false;
            }
        }

        runtime.cancel();
        let dropped = self.queue.cancel_workflow(workflow_id);
        runtime.clear_scheduled();
        self.monitor
            .record_workflow_completion(workflow_id, WorkflowStatus::Failed);

        warn!(
            workflow_id = %workflow_id,
            review_id = %runtime.review_id,
            step = step.unwrap_or("-"),
            dropped_tasks = dropped.len(),
            error = message,
            "Workflow failed"
        );
        log_workflow_operation(
            "fail_workflow",
            Some(workflow_id),
            Some(&runtime.review_id),
            "failed",
            Some(message),
        );
        true
    }

    /// Tear down runtime bookkeeping for a workflow in a terminal status
    async fn finalize(&self, workflow_id: WorkflowId, status: WorkflowStatus) {
        let review_id = self.runtimes.remove(&workflow_id).map(|(_, runtime)| {
            runtime.cancel();
            runtime.review_id.clone()
        });
        self.queue.remove_workflow(workflow_id);
        self.monitor.record_workflow_completion(workflow_id, status);
        self.state_manager.archive(workflow_id).await;

        log_workflow_operation(
            "finalize_workflow",
            Some(workflow_id),
            review_id.as_deref(),
            status.as_str(),
            None,
        );
    }

    /// Prune metrics, archived states, and `failed` workflows older than `retention`
    ///
    /// Returns the number of workflows evicted from the state manager.
    async fn cleanup(&self, retention: Duration) -> usize {
        let pruned_metrics = self.monitor.cleanup_old_metrics(retention);
        let evicted = self
            .state_manager
            .evict_stale(cutoff_before(Utc::now(), retention))
            .await;
        for workflow_id in &evicted {
            if let Some((_, runtime)) = self.runtimes.remove(workflow_id) {
                runtime.cancel();
            }
            self.queue.remove_workflow(*workflow_id);
        }
        debug!(
            pruned_metrics,
            evicted_workflows = evicted.len(),
            "Cleanup pass finished"
        );
        evicted.len()
    }

    /// Run [`cleanup`](Self::cleanup) every monitoring cleanup interval
    fn spawn_cleanup_task(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.monitoring.cleanup_interval()?;
        let retention = self.config.monitoring.retention();
        let core = self.this.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(core) = core.upgrade() else { break };
                        core.cleanup(retention).await;
                    }
                }
            }
            debug!("Cleanup task stopped");
        }))
    }

    async fn cancel_workflow(&self, workflow_id: WorkflowId) -> bool {
        let sm = state_error(workflow_id);
        let cancelled = self
            .state_manager
            .with_workflow(workflow_id, |state| {
                if state.is_terminal() {
                    return Ok(false);
                }
                state.transition_to(WorkflowStatus::Cancelled).map_err(&sm)?;
                Ok(true)
            })
            .await;

        match cancelled {
            Ok(true) => {}
            Ok(false) => return false,
            Err(error) => {
                debug!(workflow_id = %workflow_id, error = %error, "Cancel request ignored");
                return false;
            }
        }

        if let Some(runtime) = self.runtime(workflow_id) {
            runtime.cancel();
        }
        let removed = self.queue.cancel_workflow(workflow_id);
        for item in &removed {
            self.monitor
                .record_task_completion(workflow_id, item.name(), TaskStatus::Cancelled, None);
        }
        info!(workflow_id = %workflow_id, removed_tasks = removed.len(), "Workflow cancelled");
        self.finalize(workflow_id, WorkflowStatus::Cancelled).await;
        true
    }

    async fn retry_workflow(&self, workflow_id: WorkflowId) -> bool {
        let Some(runtime) = self.runtime(workflow_id) else {
            return false;
        };
        let sm = state_error(workflow_id);
        let restarted = self
            .state_manager
            .with_workflow(workflow_id, |state| {
                if state.status != WorkflowStatus::Failed {
                    return Ok(None);
                }
                state.clear_failures().map_err(&sm)?;
                state.transition_to(WorkflowStatus::Retrying).map_err(&sm)?;
                state.transition_to(WorkflowStatus::Running).map_err(&sm)?;
                Ok(Some(state.completed_steps.clone()))
            })
            .await;

        let completed = match restarted {
            Ok(Some(completed)) => completed,
            Ok(None) => return false,
            Err(error) => {
                warn!(workflow_id = %workflow_id, error = %error, "Failed to restart workflow");
                return false;
            }
        };

        runtime.next_epoch();
        runtime.clear_scheduled();
        self.queue.register_workflow(
            workflow_id,
            runtime.config.max_concurrent_tasks,
            completed.iter().cloned(),
        );
        self.monitor.record_workflow_restart(workflow_id);
        self.spawn_watchdog(workflow_id, &runtime);
        let scheduled = self.schedule_ready(workflow_id, &runtime, &completed).await;

        log_workflow_operation(
            "retry_workflow",
            Some(workflow_id),
            Some(&runtime.review_id),
            "running",
            Some(&format!("completed_steps={} rescheduled={scheduled}", completed.len())),
        );
        true
    }
}

#[async_trait]
impl TaskLifecycle for OrchestratorCore {
    async fn on_task_started(&self, item: &TaskItem) -> Option<TaskContext> {
        let runtime = self.runtime(item.workflow_id)?;
        let (epoch, token) = runtime.current_epoch();
        if token.is_cancelled() {
            return None;
        }

        let workflow_id = item.workflow_id;
        let task_name = item.name();
        let dependencies = &item.definition.dependencies;
        let sm = state_error(workflow_id);
        let started = self
            .state_manager
            .with_workflow(workflow_id, |state| {
                if state.status != WorkflowStatus::Running {
                    return Ok(None);
                }
                state.set_current_step(task_name).map_err(&sm)?;
                Ok(Some(state.results_for(dependencies.iter())))
            })
            .await;

        let dependency_results = match started {
            Ok(Some(results)) => results,
            Ok(None) => return None,
            Err(error) => {
                debug!(workflow_id = %workflow_id, task_name, error = %error, "Dropped task for unavailable workflow");
                return None;
            }
        };

        runtime.begin_attempt(item.id, epoch);
        self.monitor
            .record_task_start(workflow_id, task_name, item.id, item.attempt_number());
        debug!(
            workflow_id = %workflow_id,
            task_name,
            attempt = item.attempt_number(),
            "Task started"
        );

        Some(TaskContext {
            workflow_id,
            review_id: runtime.review_id.clone(),
            task_name: task_name.to_string(),
            attempt: item.attempt_number(),
            dependency_results,
            cancellation: token.child_token(),
        })
    }

    async fn on_task_completed(&self, item: TaskItem, result: Value) {
        let Some(runtime) = self.runtime(item.workflow_id) else {
            return;
        };
        if !runtime.finish_attempt(item.id) {
            debug!(workflow_id = %item.workflow_id, task_name = item.name(), "Discarded result of a stale attempt");
            return;
        }
        self.apply_step_outcome(&runtime, &item, StepOutcome::Completed(result))
            .await;
    }

    async fn on_task_failed(&self, mut item: TaskItem, error: TaskError) {
        let Some(runtime) = self.runtime(item.workflow_id) else {
            return;
        };
        if !runtime.finish_attempt(item.id) {
            debug!(workflow_id = %item.workflow_id, task_name = item.name(), "Discarded failure of a stale attempt");
            return;
        }

        let workflow_id = item.workflow_id;
        let task_name = item.name().to_string();
        let attempt = item.attempt_number();

        let mut context = ErrorContext::new(workflow_id, &item.definition, attempt);
        if let Some(elapsed) = item
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
        {
            context = context.with_execution_duration(elapsed);
        }
        let classification = self.classifier.classify_error(&error, &context);

        self.monitor
            .record_error(workflow_id, Some(&task_name), error.kind.name(), &error.message);

        match classification.action {
            RecoveryAction::Retry { delay } => {
                let sm = state_error(workflow_id);
                let counted = self
                    .state_manager
                    .with_workflow(workflow_id, |state| {
                        if state.status != WorkflowStatus::Running {
                            return Ok(false);
                        }
                        state.increment_retry_count().map_err(&sm)?;
                        Ok(true)
                    })
                    .await;
                if !matches!(counted, Ok(true)) {
                    return;
                }

                if let Err(e) = item.transition(TaskStatus::Retrying) {
                    warn!(workflow_id = %workflow_id, task_name = %task_name, error = %e, "Unexpected task status on retry");
                }
                self.monitor
                    .record_task_retry(workflow_id, &task_name, attempt, delay);
                info!(
                    workflow_id = %workflow_id,
                    task_name = %task_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Scheduled task retry"
                );
                self.schedule_retry(runtime, item, delay);
            }
            RecoveryAction::Skip { reason } => {
                warn!(workflow_id = %workflow_id, task_name = %task_name, reason = %reason, "Skipping failed task");
                self.apply_step_outcome(&runtime, &item, StepOutcome::Skipped(reason))
                    .await;
            }
            RecoveryAction::Fail { reason } => {
                if let Err(e) = item.transition(TaskStatus::Failed) {
                    warn!(workflow_id = %workflow_id, task_name = %task_name, error = %e, "Unexpected task status on failure");
                }
                self.monitor.record_task_completion(
                    workflow_id,
                    &task_name,
                    TaskStatus::Failed,
                    Some(&error.message),
                );
                log_task_operation(
                    "fail_task",
                    workflow_id,
                    &task_name,
                    Some(attempt),
                    "failed",
                    Some(&reason),
                );
                self.fail_workflow(workflow_id, &runtime, Some(&task_name), &reason)
                    .await;
            }
        }
    }
}

/// Builder for [`WorkflowOrchestrator`]
#[derive(Default)]
pub struct WorkflowOrchestratorBuilder {
    config: OrchestratorConfig,
    registry: Option<Arc<TaskHandlerRegistry>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    persistence: Option<Arc<dyn StatePersistence>>,
}

impl WorkflowOrchestratorBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing handler registry
    pub fn with_registry(mut self, registry: Arc<TaskHandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the [`StandardErrorClassifier`] built from the classifier config
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> Result<WorkflowOrchestrator> {
        self.config.validate()?;
        let config = self.config;

        let mut state_manager = WorkflowStateManager::new().with_persistence_retry(config.retry.clone());
        if let Some(persistence) = self.persistence {
            state_manager = state_manager.with_persistence(persistence);
        }
        let classifier = self.classifier.unwrap_or_else(|| {
            Arc::new(StandardErrorClassifier::with_config(config.classifier.clone()))
        });
        let queue = Arc::new(PriorityTaskQueue::with_capacity(config.worker_pool.max_queue_size));
        let monitor = Arc::new(WorkflowMonitor::new(config.monitoring.clone()));
        let registry = self.registry.unwrap_or_default();

        info!(
            workers = config.worker_pool.worker_count,
            classifier = classifier.classifier_name(),
            handlers = registry.len(),
            "Built workflow orchestrator"
        );

        let core = Arc::new_cyclic(|this| OrchestratorCore {
            this: this.clone(),
            config,
            state_manager: Arc::new(state_manager),
            queue,
            registry,
            classifier,
            monitor,
            runtimes: DashMap::new(),
        });

        Ok(WorkflowOrchestrator {
            core,
            pool: tokio::sync::Mutex::new(None),
            cleanup: Mutex::new(None),
        })
    }
}

/// Entry point of the engine: submits, controls, and observes workflows
pub struct WorkflowOrchestrator {
    core: Arc<OrchestratorCore>,
    pool: tokio::sync::Mutex<Option<WorkerPool>>,
    cleanup: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WorkflowOrchestrator {
    pub fn builder() -> WorkflowOrchestratorBuilder {
        WorkflowOrchestratorBuilder::default()
    }

    /// Orchestrator with the given configuration and default collaborators
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::builder().with_config(config).build()
    }

    /// Start the worker pool and the periodic cleanup task
    ///
    /// Calling `start` on a running orchestrator has no effect.
    pub async fn start(&self) {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return;
        }
        let lifecycle: Arc<dyn TaskLifecycle> = self.core.clone();
        *pool = Some(WorkerPool::start(
            self.core.config.worker_pool.clone(),
            Arc::clone(&self.core.queue),
            Arc::clone(&self.core.registry),
            lifecycle,
        ));

        let shutdown = CancellationToken::new();
        if let Some(handle) = self.core.spawn_cleanup_task(shutdown.clone()) {
            *self.cleanup.lock() = Some((shutdown, handle));
        }
        info!("Workflow orchestrator started");
    }

    /// Stop the worker pool and background tasks
    ///
    /// Workflows keep their current status; queued tasks stay queued until the
    /// orchestrator is started again. Queued state snapshots get the worker
    /// shutdown grace period to reach the store.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
        let cleanup = self.cleanup.lock().take();
        if let Some((token, handle)) = cleanup {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Cleanup task ended abnormally");
            }
        }
        let grace = self.core.config.worker_pool.shutdown_timeout();
        if tokio::time::timeout(grace, self.core.state_manager.flush())
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "Pending state snapshots not written before shutdown");
        }
        info!("Workflow orchestrator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Validate `config`, create a workflow for `review_id`, and enqueue its root tasks
    ///
    /// Returns as soon as the root tasks are queued. Later failures are
    /// reflected in the workflow status rather than returned here.
    #[instrument(skip(self, config), fields(workflow_name = %config.name))]
    pub async fn start_workflow(&self, config: WorkflowConfig, review_id: &str) -> Result<WorkflowId> {
        self.core.start_workflow(config, review_id).await
    }

    /// Cancel a workflow that is not yet in a terminal status
    ///
    /// Queued tasks are removed and running handlers see their cancellation
    /// token fire. Returns `false` for unknown or already terminal workflows.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId) -> bool {
        self.core.cancel_workflow(workflow_id).await
    }

    /// Restart a failed workflow from its completed steps
    ///
    /// Returns `false` unless the workflow is currently `failed`.
    #[instrument(skip(self))]
    pub async fn retry_workflow(&self, workflow_id: WorkflowId) -> bool {
        self.core.retry_workflow(workflow_id).await
    }

    pub async fn get_workflow_status(&self, workflow_id: WorkflowId) -> Option<WorkflowStatus> {
        self.core.state_manager.status(workflow_id).await
    }

    pub async fn get_workflow_state(&self, workflow_id: WorkflowId) -> Option<WorkflowState> {
        self.core.state_manager.get_workflow(workflow_id).await
    }

    /// Wait until the workflow is completed, failed, or cancelled
    pub async fn wait_for_completion(
        &self,
        workflow_id: WorkflowId,
        timeout: Duration,
    ) -> Result<WorkflowState> {
        let poll = async {
            loop {
                match self.core.state_manager.get_workflow(workflow_id).await {
                    None => return Err(OrchestratorError::WorkflowNotFound(workflow_id)),
                    Some(state) if state.status.is_finished() => return Ok(state),
                    Some(_) => tokio::time::sleep(COMPLETION_POLL_INTERVAL).await,
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            OrchestratorError::Timeout(format!(
                "workflow {workflow_id} did not finish within {}ms",
                timeout.as_millis()
            ))
        })?
    }

    /// Reload a workflow snapshot from persistence into memory
    pub async fn restore_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>> {
        self.core.state_manager.restore_workflow(workflow_id).await
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowState> {
        self.core.state_manager.list_workflows().await
    }

    pub async fn workflows_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowState> {
        self.core.state_manager.workflows_by_status(status).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.core.state_manager.subscribe()
    }

    pub fn get_workflow_metrics(&self, workflow_id: WorkflowId) -> Option<WorkflowMetrics> {
        self.core.monitor.workflow_metrics(workflow_id)
    }

    /// Aggregate metrics over `window`, or over the retention period when `None`
    pub fn performance_summary(&self, window: Option<Duration>) -> PerformanceMetrics {
        self.core.monitor.performance_summary(window)
    }

    pub fn system_health(&self) -> SystemHealth {
        let mut health = self.core.monitor.system_health();
        health.queue_depth = self.core.queue.len();
        health
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.core.queue.stats()
    }

    /// Items of one workflow still waiting in the queue
    pub fn queued_task_count(&self, workflow_id: WorkflowId) -> usize {
        self.core.queue.queued_for(workflow_id)
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.core.classifier.error_stats()
    }

    /// Evict finished state and `failed` workflows older than `retention`
    ///
    /// Also prunes monitor metrics past the same window. Returns the number of
    /// workflows evicted; their stored snapshots stay restorable.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        self.core.cleanup(retention).await
    }

    /// Workflows currently tracked for execution (not yet terminal)
    pub fn active_workflow_count(&self) -> usize {
        self.core.runtimes.len()
    }

    /// Associate `task_name` with the handler that executes it
    pub fn register_task_handler(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.core.registry.register(task_name, handler);
    }

    pub fn registry(&self) -> &Arc<TaskHandlerRegistry> {
        &self.core.registry
    }

    pub fn monitor(&self) -> &Arc<WorkflowMonitor> {
        &self.core.monitor
    }

    pub fn state_manager(&self) -> &Arc<WorkflowStateManager> {
        &self.core.state_manager
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.core.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;
    use crate::models::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            worker_pool: WorkerPoolConfig {
                worker_count: 3,
                idle_poll_interval_ms: 5,
                ..WorkerPoolConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        }
    }

    async fn started() -> WorkflowOrchestrator {
        let orchestrator = WorkflowOrchestrator::new(fast_config()).unwrap();
        orchestrator.start().await;
        orchestrator
    }

    #[tokio::test]
    async fn test_results_flow_to_dependents() {
        let orchestrator = started().await;
        orchestrator
            .registry()
            .register_fn("parse", |_p, _ctx| async move { Ok(json!({ "files": 3 })) });
        orchestrator.registry().register_fn("report", |_p, ctx| async move {
            Ok(json!({ "seen": ctx.dependency_results["parse"]["files"] }))
        });

        let config = WorkflowConfig::new("chain")
            .with_task(TaskDefinition::new("parse"))
            .with_task(TaskDefinition::new("report").depends_on(["parse"]));
        let id = orchestrator.start_workflow(config, "review-1").await.unwrap();
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.step_data["report"]["seen"], json!(3));
        assert_eq!(orchestrator.active_workflow_count(), 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_workflow_over_task_limit() {
        let mut config = fast_config();
        config.limits.max_tasks_per_workflow = 1;
        let orchestrator = WorkflowOrchestrator::new(config).unwrap();

        let workflow = WorkflowConfig::new("two")
            .with_task(TaskDefinition::new("a"))
            .with_task(TaskDefinition::new("b"));
        let err = orchestrator.start_workflow(workflow, "r").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflowConfig(_)));
        assert!(orchestrator.list_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn test_skippable_task_failure_does_not_fail_workflow() {
        let orchestrator = started().await;
        orchestrator.registry().register_fn("style", |_p, _ctx| async move {
            Err(TaskError::validation("style config missing"))
        });
        orchestrator
            .registry()
            .register_fn("summary", |_p, _ctx| async move { Ok(json!("ok")) });

        let config = WorkflowConfig::new("lenient")
            .with_task(TaskDefinition::new("style").skippable())
            .with_task(TaskDefinition::new("summary").depends_on(["style"]));
        let id = orchestrator.start_workflow(config, "review-2").await.unwrap();
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(state.completed_steps.contains("style"));
        assert!(state.step_data["_warnings"]["style"].is_string());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_workflow_resumes_from_completed_steps() {
        let orchestrator = started().await;
        let fetch_calls = Arc::new(AtomicU32::new(0));
        let analyze_calls = Arc::new(AtomicU32::new(0));

        let calls = Arc::clone(&fetch_calls);
        orchestrator.registry().register_fn("fetch", move |_p, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("diff"))
            }
        });
        let calls = Arc::clone(&analyze_calls);
        orchestrator.registry().register_fn("analyze", move |_p, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::contract("bad response"))
                } else {
                    Ok(json!("clean"))
                }
            }
        });

        let config = WorkflowConfig::new("restartable")
            .with_task(TaskDefinition::new("fetch"))
            .with_task(TaskDefinition::new("analyze").depends_on(["fetch"]));
        let id = orchestrator.start_workflow(config, "review-3").await.unwrap();
        let failed = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.failed_steps.contains("analyze"));

        assert!(orchestrator.retry_workflow(id).await);
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(state.failed_steps.is_empty());
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(analyze_calls.load(Ordering::SeqCst), 2);
        assert!(!orchestrator.retry_workflow(id).await);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_overall_timeout_fails_workflow() {
        let orchestrator = started().await;
        orchestrator.registry().register_fn("slow", |_p, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(null))
        });

        let config = WorkflowConfig::new("deadline")
            .with_task(TaskDefinition::new("slow"))
            .with_overall_timeout(Some(Duration::from_millis(50)));
        let id = orchestrator.start_workflow(config, "review-4").await.unwrap();
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error_message.unwrap().contains("overall timeout"));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let orchestrator = started().await;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        orchestrator.registry().register_fn("flaky", move |_p, _ctx| {
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::connection("reset by peer"))
                } else {
                    Ok(json!("done"))
                }
            }
        });

        let config = WorkflowConfig::new("flaky")
            .with_task(TaskDefinition::new("flaky").with_retry_policy(fast_retry(3)));
        let id = orchestrator.start_workflow(config, "review-5").await.unwrap();
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.retry_count, 2);
        let metrics = orchestrator.get_workflow_metrics(id).unwrap();
        assert_eq!(metrics.task_metrics["flaky"].retry_count, 2);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_releases_failed_workflow_bookkeeping() {
        let orchestrator = started().await;
        orchestrator.registry().register_fn("lint", |_p, _ctx| async move {
            Err(TaskError::validation("unparseable diff"))
        });
        let config = WorkflowConfig::new("doomed")
            .with_task(TaskDefinition::new("lint"))
            .with_task(TaskDefinition::new("report").depends_on(["lint"]));
        let id = orchestrator.start_workflow(config, "review-6").await.unwrap();
        let state = orchestrator
            .wait_for_completion(id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);

        let core = &orchestrator.core;
        assert_eq!(core.runtimes.len(), 1);
        assert_eq!(core.queue.workflow_count(), 1);

        assert_eq!(core.cleanup(Duration::ZERO).await, 1);
        assert!(core.runtimes.is_empty());
        assert_eq!(core.queue.workflow_count(), 0);
        assert!(core.state_manager.is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_task_follows_interval_and_shutdown() {
        let mut config = fast_config();
        config.monitoring.cleanup_interval_seconds = 1;
        let orchestrator = WorkflowOrchestrator::new(config).unwrap();
        let shutdown = CancellationToken::new();
        let handle = orchestrator.core.spawn_cleanup_task(shutdown.clone()).unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        let mut disabled = fast_config();
        disabled.monitoring.cleanup_interval_seconds = 0;
        let orchestrator = WorkflowOrchestrator::new(disabled).unwrap();
        assert!(orchestrator
            .core
            .spawn_cleanup_task(CancellationToken::new())
            .is_none());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_workflow() {
        let orchestrator = WorkflowOrchestrator::new(fast_config()).unwrap();
        let err = orchestrator
            .wait_for_completion(Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkflowNotFound(_)));
        assert!(!orchestrator.cancel_workflow(Uuid::new_v4()).await);
    }
}
