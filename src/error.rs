//! # Orchestrator Errors
//!
//! Crate-level error type returned by the public orchestration API. Task-level
//! failures raised by handlers live in [`crate::orchestration::errors`]; they are
//! classified and recorded on the workflow rather than surfaced here.

use crate::config::ConfigurationError;
use crate::persistence::PersistenceError;
use crate::state_machine::errors::StateMachineError;
use crate::state_machine::WorkflowStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid workflow configuration: {0}")]
    InvalidWorkflowConfig(String),

    #[error("Workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Workflow {workflow_id} is in terminal state {status} and cannot be modified")]
    TerminalState {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("No handler registered for task '{0}'")]
    HandlerNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Wrap a state machine error with the workflow it was raised for.
    pub fn from_state_machine(workflow_id: Uuid, error: StateMachineError) -> Self {
        match error {
            StateMachineError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            StateMachineError::TerminalState(status) => Self::TerminalState {
                workflow_id,
                status,
            },
            other @ StateMachineError::InvalidTaskTransition { .. } => {
                Self::Internal(format!("workflow {workflow_id}: {other}"))
            }
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<ConfigurationError> for OrchestratorError {
    fn from(error: ConfigurationError) -> Self {
        Self::Configuration(error.to_string())
    }
}

impl From<PersistenceError> for OrchestratorError {
    fn from(error: PersistenceError) -> Self {
        Self::Persistence(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
