//! # Workflow State Manager
//!
//! Owns every [`WorkflowState`] and serializes mutations per workflow.
//!
//! ## Concurrency
//!
//! The map is partitioned by workflow: each live workflow sits behind its own
//! async mutex, so mutations of different workflows never contend and every
//! read-modify-write on one workflow is atomic. Once a workflow reaches
//! `completed` or `cancelled` it is immutable; [`archive`](WorkflowStateManager::archive)
//! then swaps the lock for a plain shared snapshot so the lock can be dropped.
//!
//! ## Key Features
//!
//! - **Validated transitions**: every status change goes through the transition table
//! - **Transactions**: [`with_workflow`](WorkflowStateManager::with_workflow) rolls back on error
//! - **Change events**: subscribers receive a [`StateChangeEvent`] per effective change
//! - **Snapshots**: an optional [`StatePersistence`] receives the state after each mutation
//!
//! ## Snapshot Writer
//!
//! Mutations never wait on the snapshot store. Each effective change queues a
//! copy of the state for a background writer, which saves the newest queued
//! snapshot per workflow and retries failed saves with the persistence retry
//! policy. [`flush`](WorkflowStateManager::flush) waits for queued snapshots.

use crate::constants::history::STATE_EVENT_CHANNEL_CAPACITY;
use crate::error::{OrchestratorError, Result};
use crate::models::{Parameters, RetryPolicy, WorkflowId, WorkflowState};
use crate::orchestration::errors::TaskError;
use crate::persistence::{PersistenceError, StatePersistence};
use crate::resilience::RetryHandler;
use crate::state_machine::WorkflowStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

/// Notification emitted after a workflow state changes
#[derive(Debug, Clone, PartialEq)]
pub enum StateChangeEvent {
    Created {
        workflow_id: WorkflowId,
        review_id: String,
    },
    Updated {
        workflow_id: WorkflowId,
    },
    StatusChanged {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    StepAdvanced {
        workflow_id: WorkflowId,
        step: String,
    },
    StepFailed {
        workflow_id: WorkflowId,
        step: String,
    },
}

impl StateChangeEvent {
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            Self::Created { workflow_id, .. }
            | Self::Updated { workflow_id }
            | Self::StatusChanged { workflow_id, .. }
            | Self::StepAdvanced { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Partial update applied by [`WorkflowStateManager::update_workflow`]
#[derive(Debug, Clone, Default)]
pub struct WorkflowStateUpdate {
    pub status: Option<WorkflowStatus>,
    pub current_step: Option<String>,
    pub step_data: Option<Parameters>,
    /// `Some(None)` clears the message
    pub error_message: Option<Option<String>>,
}

impl WorkflowStateUpdate {
    pub fn status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_step_data(mut self, data: Parameters) -> Self {
        self.step_data = Some(data);
        self
    }

    pub fn with_error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }
}

#[derive(Clone)]
enum Slot {
    Active(Arc<Mutex<WorkflowState>>),
    Archived(Arc<WorkflowState>),
}

enum SnapshotCommand {
    Save(Box<WorkflowState>),
    Flush(oneshot::Sender<()>),
}

/// Background task draining queued snapshots into the store
struct SnapshotWriter {
    persistence: Arc<dyn StatePersistence>,
    policy: RetryPolicy,
    retry_handler: Arc<RetryHandler>,
}

impl SnapshotWriter {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<SnapshotCommand>) {
        while let Some(first) = commands.recv().await {
            // Newest snapshot per workflow, in arrival order.
            let mut pending: Vec<WorkflowState> = Vec::new();
            let mut flushes = Vec::new();
            let mut next = Some(first);
            while let Some(command) = next.take() {
                match command {
                    SnapshotCommand::Save(state) => {
                        match pending.iter_mut().find(|p| p.workflow_id == state.workflow_id) {
                            Some(queued) => *queued = *state,
                            None => pending.push(*state),
                        }
                    }
                    SnapshotCommand::Flush(done) => flushes.push(done),
                }
                next = commands.try_recv().ok();
            }

            for state in &pending {
                self.save(state).await;
            }
            for done in flushes {
                let _ = done.send(());
            }
        }
        debug!("Snapshot writer stopped");
    }

    async fn save(&self, state: &WorkflowState) {
        let persistence = &self.persistence;
        let result = self
            .retry_handler
            .execute_with_retry("state_persistence.save", &self.policy, |_| async move {
                persistence.save_state(state).await.map_err(|e| match e {
                    PersistenceError::Backend(msg) => TaskError::connection(msg),
                    PersistenceError::Serialization(msg) => TaskError::validation(msg),
                })
            })
            .await;
        if let Err(error) = result {
            warn!(
                workflow_id = %state.workflow_id,
                error = %error,
                "Failed to persist workflow state"
            );
        }
    }
}

pub struct WorkflowStateManager {
    slots: DashMap<WorkflowId, Slot>,
    events: broadcast::Sender<StateChangeEvent>,
    persistence: Option<Arc<dyn StatePersistence>>,
    persistence_retry: RetryPolicy,
    retry_handler: Arc<RetryHandler>,
    writer: parking_lot::Mutex<Option<mpsc::UnboundedSender<SnapshotCommand>>>,
}

impl std::fmt::Debug for WorkflowStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStateManager")
            .field("workflows", &self.slots.len())
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

impl Default for WorkflowStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStateManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_EVENT_CHANNEL_CAPACITY);
        Self {
            slots: DashMap::new(),
            events,
            persistence: None,
            persistence_retry: RetryPolicy::default_transient()
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(200)),
            retry_handler: Arc::new(RetryHandler::new()),
            writer: parking_lot::Mutex::new(None),
        }
    }

    /// Attach a snapshot store; saves are retried on transient backend errors
    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_persistence_retry(mut self, policy: RetryPolicy) -> Self {
        self.persistence_retry = policy;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StateChangeEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn slot(&self, workflow_id: WorkflowId) -> Result<Slot> {
        self.slots
            .get(&workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or(OrchestratorError::WorkflowNotFound(workflow_id))
    }

    /// Sender to the snapshot writer, spawning it on first use
    fn writer(&self) -> Option<mpsc::UnboundedSender<SnapshotCommand>> {
        let persistence = self.persistence.as_ref()?;
        let mut writer = self.writer.lock();
        let sender = writer.get_or_insert_with(|| {
            let (sender, commands) = mpsc::unbounded_channel();
            let task = SnapshotWriter {
                persistence: Arc::clone(persistence),
                policy: self.persistence_retry.clone(),
                retry_handler: Arc::clone(&self.retry_handler),
            };
            tokio::spawn(task.run(commands));
            sender
        });
        Some(sender.clone())
    }

    /// Queue a snapshot; never waits on the store
    fn persist(&self, state: &WorkflowState) {
        let Some(writer) = self.writer() else {
            return;
        };
        if writer
            .send(SnapshotCommand::Save(Box::new(state.clone())))
            .is_err()
        {
            warn!(workflow_id = %state.workflow_id, "Snapshot writer is gone; state not persisted");
        }
    }

    /// Wait until every snapshot queued so far has been written or given up on
    pub async fn flush(&self) {
        let Some(writer) = self.writer() else {
            return;
        };
        let (done, written) = oneshot::channel();
        if writer.send(SnapshotCommand::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }

    /// Create a pending workflow and return a snapshot of it
    #[instrument(skip(self))]
    pub async fn create_workflow(
        &self,
        review_id: &str,
        config_name: &str,
        initial_step: Option<String>,
    ) -> Result<WorkflowState> {
        let state = WorkflowState::new(review_id, config_name, initial_step);
        let workflow_id = state.workflow_id;
        self.slots
            .insert(workflow_id, Slot::Active(Arc::new(Mutex::new(state.clone()))));
        self.persist(&state);

        info!(workflow_id = %workflow_id, review_id, config_name, "Created workflow");
        self.publish(StateChangeEvent::Created {
            workflow_id,
            review_id: review_id.to_string(),
        });
        Ok(state)
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Option<WorkflowState> {
        match self.slot(workflow_id).ok()? {
            Slot::Active(lock) => Some(lock.lock().await.clone()),
            Slot::Archived(state) => Some(state.as_ref().clone()),
        }
    }

    pub async fn status(&self, workflow_id: WorkflowId) -> Option<WorkflowStatus> {
        match self.slot(workflow_id).ok()? {
            Slot::Active(lock) => Some(lock.lock().await.status),
            Slot::Archived(state) => Some(state.status),
        }
    }

    /// Run `f` against the workflow under its lock
    ///
    /// If `f` returns an error the state is restored to what it was before the
    /// call. Effective changes are persisted and published as events.
    #[instrument(skip(self, f))]
    pub async fn with_workflow<F, R>(&self, workflow_id: WorkflowId, f: F) -> Result<R>
    where
        F: FnOnce(&mut WorkflowState) -> Result<R> + Send,
        R: Send,
    {
        let lock = match self.slot(workflow_id)? {
            Slot::Active(lock) => lock,
            Slot::Archived(state) => {
                return Err(OrchestratorError::TerminalState {
                    workflow_id,
                    status: state.status,
                })
            }
        };

        let mut state = lock.lock().await;
        let before = state.clone();
        let output = match f(&mut *state) {
            Ok(output) => output,
            Err(error) => {
                *state = before;
                debug!(workflow_id = %workflow_id, error = %error, "Rolled back workflow mutation");
                return Err(error);
            }
        };

        if *state != before {
            self.persist(&state);
            self.publish_diff(&before, &*state);
        }
        Ok(output)
    }

    fn publish_diff(&self, before: &WorkflowState, after: &WorkflowState) {
        let workflow_id = after.workflow_id;
        for step in after.completed_steps.difference(&before.completed_steps) {
            self.publish(StateChangeEvent::StepAdvanced {
                workflow_id,
                step: step.clone(),
            });
        }
        for step in after.failed_steps.difference(&before.failed_steps) {
            self.publish(StateChangeEvent::StepFailed {
                workflow_id,
                step: step.clone(),
            });
        }
        if before.status != after.status {
            info!(
                workflow_id = %workflow_id,
                from = %before.status,
                to = %after.status,
                "Workflow status changed"
            );
            self.publish(StateChangeEvent::StatusChanged {
                workflow_id,
                from: before.status,
                to: after.status,
            });
        }
        self.publish(StateChangeEvent::Updated { workflow_id });
    }

    /// Apply a partial update; a status change is validated first
    pub async fn update_workflow(
        &self,
        workflow_id: WorkflowId,
        update: WorkflowStateUpdate,
    ) -> Result<WorkflowState> {
        self.with_workflow(workflow_id, move |state| {
            let sm = |e| OrchestratorError::from_state_machine(workflow_id, e);
            state.ensure_mutable().map_err(sm)?;
            if let Some(status) = update.status {
                state.transition_to(status).map_err(sm)?;
            }
            if let Some(step) = update.current_step {
                state.set_current_step(step).map_err(sm)?;
            }
            if let Some(data) = update.step_data {
                state.merge_step_data(data).map_err(sm)?;
            }
            if let Some(message) = update.error_message {
                state.set_error_message(message).map_err(sm)?;
            }
            Ok(state.clone())
        })
        .await
    }

    pub async fn transition(
        &self,
        workflow_id: WorkflowId,
        to: WorkflowStatus,
    ) -> Result<WorkflowState> {
        self.update_workflow(workflow_id, WorkflowStateUpdate::status(to))
            .await
    }

    pub async fn advance_step(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        result: Option<Value>,
    ) -> Result<WorkflowState> {
        self.with_workflow(workflow_id, |state| {
            state
                .advance_step(step, result)
                .map_err(|e| OrchestratorError::from_state_machine(workflow_id, e))?;
            Ok(state.clone())
        })
        .await
    }

    pub async fn mark_step_failed(
        &self,
        workflow_id: WorkflowId,
        step: &str,
        error: &str,
    ) -> Result<WorkflowState> {
        self.with_workflow(workflow_id, |state| {
            state
                .mark_step_failed(step, error)
                .map_err(|e| OrchestratorError::from_state_machine(workflow_id, e))?;
            Ok(state.clone())
        })
        .await
    }

    pub async fn increment_retry_count(&self, workflow_id: WorkflowId) -> Result<u32> {
        self.with_workflow(workflow_id, |state| {
            state
                .increment_retry_count()
                .map_err(|e| OrchestratorError::from_state_machine(workflow_id, e))
        })
        .await
    }

    /// Replace the lock of a terminal workflow with an immutable snapshot
    ///
    /// Returns false when the workflow is unknown or not terminal.
    pub async fn archive(&self, workflow_id: WorkflowId) -> bool {
        let Ok(Slot::Active(lock)) = self.slot(workflow_id) else {
            return false;
        };
        let snapshot = {
            let state = lock.lock().await;
            if !state.is_terminal() {
                return false;
            }
            state.clone()
        };
        self.slots
            .insert(workflow_id, Slot::Archived(Arc::new(snapshot)));
        debug!(workflow_id = %workflow_id, "Archived workflow state");
        true
    }

    /// Load a workflow from the snapshot store if it is not already in memory
    pub async fn restore_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>> {
        if let Some(state) = self.get_workflow(workflow_id).await {
            return Ok(Some(state));
        }
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };
        let Some(state) = persistence.load_state(workflow_id).await? else {
            return Ok(None);
        };
        let slot = if state.is_terminal() {
            Slot::Archived(Arc::new(state.clone()))
        } else {
            Slot::Active(Arc::new(Mutex::new(state.clone())))
        };
        self.slots.entry(workflow_id).or_insert(slot);
        info!(workflow_id = %workflow_id, status = %state.status, "Restored workflow state");
        Ok(Some(state))
    }

    pub fn remove_workflow(&self, workflow_id: WorkflowId) -> bool {
        self.slots.remove(&workflow_id).is_some()
    }

    /// Drop finished (`completed`, `cancelled`, `failed`) workflows last updated at or before `cutoff`
    ///
    /// Returns the evicted ids. Stored snapshots are kept, so an evicted
    /// workflow can still be brought back with [`restore_workflow`](Self::restore_workflow).
    pub async fn evict_stale(&self, cutoff: DateTime<Utc>) -> Vec<WorkflowId> {
        let slots: Vec<(WorkflowId, Slot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut evicted = Vec::new();
        for (workflow_id, slot) in slots {
            let removed = match slot {
                Slot::Archived(state) => {
                    state.updated_at <= cutoff && self.slots.remove(&workflow_id).is_some()
                }
                Slot::Active(lock) => {
                    let state = lock.lock().await;
                    let finished = state.is_terminal() || state.status == WorkflowStatus::Failed;
                    let evict = finished
                        && state.updated_at <= cutoff
                        && self
                            .slots
                            .remove_if(&workflow_id, |_, current| {
                                matches!(current, Slot::Active(l) if Arc::ptr_eq(l, &lock))
                            })
                            .is_some();
                    drop(state);
                    evict
                }
            };
            if removed {
                evicted.push(workflow_id);
            }
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Evicted stale workflow states");
        }
        evicted
    }

    async fn snapshots(&self) -> Vec<WorkflowState> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut states = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Active(lock) => states.push(lock.lock().await.clone()),
                Slot::Archived(state) => states.push(state.as_ref().clone()),
            }
        }
        states.sort_by_key(|s| s.created_at);
        states
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowState> {
        self.snapshots().await
    }

    pub async fn workflows_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowState> {
        self.snapshots()
            .await
            .into_iter()
            .filter(|s| s.status == status)
            .collect()
    }

    pub async fn workflows_by_review(&self, review_id: &str) -> Vec<WorkflowState> {
        self.snapshots()
            .await
            .into_iter()
            .filter(|s| s.review_id == review_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Workflows still holding a lock (not archived)
    pub fn active_lock_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Active(_)))
            .count()
    }
}
