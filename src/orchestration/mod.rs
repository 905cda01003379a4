//! # Orchestration Engine
//!
//! Scheduling, execution, and recovery for review workflows.
//!
//! ## Core Components
//!
//! - **WorkflowOrchestrator**: entry point that admits workflows and reacts to task outcomes
//! - **PriorityTaskQueue**: priority-ordered queue gated on dependencies and per-workflow concurrency
//! - **WorkerPool**: fixed set of worker slots running handlers under their timeouts
//! - **WorkflowStateManager**: per-workflow locked state with persistence and change events
//! - **ErrorClassifier**: maps task failures to retry, skip, or fail
//! - **BackoffCalculator**: retry delay computation for the supported strategies

pub mod backoff_calculator;
pub mod error_classifier;
pub mod errors;
pub mod state_manager;
pub mod task_queue;
pub mod worker_pool;
pub mod workflow_coordinator;

pub use backoff_calculator::{compute_delay, should_retry};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorClassifierConfig, ErrorContext,
    ErrorStats, RecoveryAction, RecoveryRule, RuleAction, StandardErrorClassifier,
};
pub use errors::{ErrorKind, TaskError, TaskResult};
pub use state_manager::{StateChangeEvent, WorkflowStateManager, WorkflowStateUpdate};
pub use task_queue::{PriorityTaskQueue, QueueError, QueueStats};
pub use worker_pool::{TaskLifecycle, WorkerPool};
pub use workflow_coordinator::{WorkflowOrchestrator, WorkflowOrchestratorBuilder};
