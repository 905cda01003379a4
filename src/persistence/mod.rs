//! # Workflow State Persistence
//!
//! Optional snapshot storage for [`WorkflowState`]. The state manager writes a
//! snapshot after every successful mutation and can restore a workflow from its
//! last snapshot. Persistence failures are logged and never fail the mutation
//! that triggered them.
//!
//! Implementations decide their own storage format; the in-memory store keeps
//! JSON documents so that round-tripping through serialization is exercised.

use crate::models::{WorkflowId, WorkflowState};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Trait for persisting workflow state snapshots
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Store the latest snapshot of a workflow
    async fn save_state(&self, state: &WorkflowState) -> PersistenceResult<()>;

    /// Load the last stored snapshot, if any
    async fn load_state(&self, workflow_id: WorkflowId) -> PersistenceResult<Option<WorkflowState>>;

    /// Drop a stored snapshot
    async fn delete_state(&self, workflow_id: WorkflowId) -> PersistenceResult<()>;
}

/// Process-local snapshot store
#[derive(Debug, Default)]
pub struct InMemoryStatePersistence {
    documents: DashMap<WorkflowId, String>,
    saves: AtomicU64,
    fail_writes: AtomicBool,
}

impl InMemoryStatePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves since creation
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Make subsequent writes fail, for exercising error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl StatePersistence for InMemoryStatePersistence {
    async fn save_state(&self, state: &WorkflowState) -> PersistenceResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(PersistenceError::Backend(
                "writes are disabled for this store".to_string(),
            ));
        }
        let document = serde_json::to_string(state)?;
        self.documents.insert(state.workflow_id, document);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_state(&self, workflow_id: WorkflowId) -> PersistenceResult<Option<WorkflowState>> {
        let Some(document) = self.documents.get(&workflow_id).map(|d| d.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&document)?))
    }

    async fn delete_state(&self, workflow_id: WorkflowId) -> PersistenceResult<()> {
        self.documents.remove(&workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::WorkflowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = InMemoryStatePersistence::new();
        let mut state = WorkflowState::new("review-7", "standard", None);
        state.transition_to(WorkflowStatus::Running).unwrap();
        state.advance_step("lint", Some(json!({"issues": 3}))).unwrap();

        store.save_state(&state).await.unwrap();
        let loaded = store.load_state(state.workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.save_count(), 1);

        store.delete_state(state.workflow_id).await.unwrap();
        assert!(store.load_state(state.workflow_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = InMemoryStatePersistence::new();
        store.set_fail_writes(true);
        let state = WorkflowState::new("review-8", "standard", None);
        assert!(matches!(
            store.save_state(&state).await,
            Err(PersistenceError::Backend(_))
        ));
        assert!(store.is_empty());
    }
}
