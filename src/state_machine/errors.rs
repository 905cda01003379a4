use super::states::{TaskStatus, WorkflowStatus};
use thiserror::Error;

/// Errors raised while validating workflow status changes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },

    #[error("Workflow is in terminal state {0}")]
    TerminalState(WorkflowStatus),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
