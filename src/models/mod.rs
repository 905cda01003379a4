//! # Data Model
//!
//! Workflow definitions (what to run) and runtime records (what is running).

pub mod retry_policy;
pub mod task_definition;
pub mod task_item;
pub mod workflow_config;
pub mod workflow_state;

pub use retry_policy::{BackoffStrategy, RetryPolicy};
pub use task_definition::{TaskDefinition, TaskPriority};
pub use task_item::TaskItem;
pub use workflow_config::WorkflowConfig;
pub use workflow_state::WorkflowState;

/// Identifier of a workflow instance
pub type WorkflowId = uuid::Uuid;

/// Free-form JSON object used for task parameters, results and step data
pub type Parameters = serde_json::Map<String, serde_json::Value>;
