#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Review Orchestrator
//!
//! Async workflow orchestration engine for multi-step code review pipelines.
//!
//! ## Overview
//!
//! A review workflow is a set of named tasks (fetch the diff, run linters,
//! analyze security, summarize) connected by dependencies. The orchestrator
//! runs ready tasks concurrently on a worker pool, passes dependency results
//! forward, retries transient failures with backoff, skips non-critical tasks
//! that fail, and records metrics for every run.
//!
//! ## Architecture
//!
//! Task handlers are supplied by the embedding application through the
//! [`registry::TaskHandlerRegistry`]. The engine owns scheduling, state, and
//! recovery; handlers own the review logic.
//!
//! ## Module Organization
//!
//! - [`models`] - Workflow definitions, task items, and workflow state
//! - [`state_machine`] - Workflow and task statuses with their transition rules
//! - [`orchestration`] - Queue, worker pool, classifier, state manager, and coordinator
//! - [`monitoring`] - Per-workflow metrics, summaries, and health
//! - [`registry`] - Task handler registration and lookup
//! - [`resilience`] - Retry helper for async operations
//! - [`persistence`] - Pluggable snapshot storage for workflow state
//! - [`config`] - Layered configuration loading
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use review_orchestrator::models::{TaskDefinition, WorkflowConfig};
//! use review_orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! review_orchestrator::logging::init_structured_logging();
//!
//! let orchestrator = WorkflowOrchestrator::new(OrchestratorConfig::default())?;
//! orchestrator.registry().register_fn("fetch_diff", |_params, _ctx| async move {
//!     Ok(json!({ "files": ["src/lib.rs"] }))
//! });
//! orchestrator.registry().register_fn("lint", |_params, ctx| async move {
//!     let files = &ctx.dependency_results["fetch_diff"]["files"];
//!     Ok(json!({ "checked": files }))
//! });
//! orchestrator.start().await;
//!
//! let workflow = WorkflowConfig::new("standard-review")
//!     .with_task(TaskDefinition::new("fetch_diff"))
//!     .with_task(TaskDefinition::new("lint").depends_on(["fetch_diff"]));
//! let id = orchestrator.start_workflow(workflow, "PR-1234").await?;
//! let state = orchestrator.wait_for_completion(id, Duration::from_secs(60)).await?;
//! println!("review finished: {}", state.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod resilience;
pub mod state_machine;
pub mod utils;
pub mod validation;

pub use config::{ConfigManager, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use models::{
    RetryPolicy, TaskDefinition, TaskItem, TaskPriority, WorkflowConfig, WorkflowId,
    WorkflowState,
};
pub use monitoring::{PerformanceMetrics, SystemHealth, WorkflowMetrics, WorkflowMonitor};
pub use orchestration::{ErrorKind, TaskError, TaskResult, WorkflowOrchestrator};
pub use registry::{TaskContext, TaskHandler, TaskHandlerRegistry};
pub use state_machine::{TaskStatus, WorkflowStatus};
