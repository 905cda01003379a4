// State machine module for workflow orchestration
//
// Status enums for workflows and task items plus the transition table that every
// status change on a workflow is validated against.

pub mod errors;
pub mod states;
pub mod transitions;

pub use errors::{StateMachineError, StateMachineResult};
pub use states::{TaskStatus, WorkflowStatus};
pub use transitions::{allowed_transitions, can_transition, validate_transition};
