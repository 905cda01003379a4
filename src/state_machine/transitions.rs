//! Workflow status transition table.
//!
//! ```text
//! pending   -> running | cancelled
//! running   -> completed | failed | cancelled | retrying
//! failed    -> retrying | cancelled
//! retrying  -> running | failed | cancelled
//! completed -> (terminal)
//! cancelled -> (terminal)
//! ```

use super::errors::{StateMachineError, StateMachineResult};
use super::states::WorkflowStatus;

/// Successor states allowed from `from`
pub fn allowed_transitions(from: WorkflowStatus) -> &'static [WorkflowStatus] {
    use WorkflowStatus::*;
    match from {
        Pending => &[Running, Cancelled],
        Running => &[Completed, Failed, Cancelled, Retrying],
        Failed => &[Retrying, Cancelled],
        Retrying => &[Running, Failed, Cancelled],
        Completed | Cancelled => &[],
    }
}

pub fn can_transition(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Validate a status change, distinguishing terminal sources from illegal edges
pub fn validate_transition(from: WorkflowStatus, to: WorkflowStatus) -> StateMachineResult<()> {
    if from.is_terminal() {
        return Err(StateMachineError::TerminalState(from));
    }
    if !can_transition(from, to) {
        return Err(StateMachineError::InvalidTransition { from, to });
    }
    Ok(())
}
