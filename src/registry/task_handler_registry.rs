//! # Task Handler Registry
//!
//! Maps task names to the handlers that execute them.
//!
//! ## Architecture
//!
//! ```text
//! TaskItem.name -> TaskHandlerRegistry -> Arc<dyn TaskHandler> -> handle(parameters, context)
//! ```
//!
//! The registry is constructed by the caller and injected into the orchestrator,
//! so tests and embedders can supply their own handlers. Lookups never block: the
//! registry is a concurrent map and handlers are shared behind `Arc`.
//!
//! ## Usage
//!
//! ```rust
//! use review_orchestrator::registry::TaskHandlerRegistry;
//! use serde_json::json;
//!
//! let registry = TaskHandlerRegistry::new();
//! registry.register_fn("lint", |params, _ctx| async move {
//!     Ok(json!({ "files": params.get("files").cloned() }))
//! });
//! assert!(registry.contains("lint"));
//! ```

use crate::models::{Parameters, WorkflowId};
use crate::orchestration::errors::TaskResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Execution context handed to a handler alongside its parameters
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: WorkflowId,
    pub review_id: String,
    pub task_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Results of the task's dependencies, keyed by step name
    pub dependency_results: Parameters,
    /// Cancelled when the workflow is cancelled or fails
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Executes one named task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, parameters: Parameters, context: TaskContext) -> TaskResult<Value>;
}

/// Adapter that turns an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Parameters, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<Value>> + Send + 'static,
{
    async fn handle(&self, parameters: Parameters, context: TaskContext) -> TaskResult<Value> {
        (self.func)(parameters, context).await
    }
}

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_handlers: usize,
    pub task_names: Vec<String>,
}

/// Concurrent name -> handler map
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("task_names", &self.task_names())
            .finish()
    }
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same name
    pub fn register(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_name = task_name.into();
        if self.handlers.insert(task_name.clone(), handler).is_some() {
            info!(task_name = %task_name, "Replaced task handler");
        } else {
            debug!(task_name = %task_name, "Registered task handler");
        }
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&self, task_name: impl Into<String>, func: F)
    where
        F: Fn(Parameters, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<Value>> + Send + 'static,
    {
        self.register(task_name, Arc::new(FnHandler::new(func)));
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn unregister(&self, task_name: &str) -> bool {
        self.handlers.remove(task_name).is_some()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let task_names = self.task_names();
        RegistryStats {
            total_handlers: task_names.len(),
            task_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::errors::TaskError;
    use serde_json::json;
    use uuid::Uuid;

    fn context(task_name: &str) -> TaskContext {
        TaskContext {
            workflow_id: Uuid::new_v4(),
            review_id: "review-1".to_string(),
            task_name: task_name.to_string(),
            attempt: 1,
            dependency_results: Parameters::new(),
            cancellation: CancellationToken::new(),
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, parameters: Parameters, _context: TaskContext) -> TaskResult<Value> {
            Ok(Value::Object(parameters))
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke_trait_handler() {
        let registry = TaskHandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));

        let mut params = Parameters::new();
        params.insert("pr".to_string(), json!(42));
        let handler = registry.get("echo").unwrap();
        let result = handler.handle(params, context("echo")).await.unwrap();
        assert_eq!(result, json!({"pr": 42}));
    }

    #[tokio::test]
    async fn test_closure_handler_errors_propagate() {
        let registry = TaskHandlerRegistry::new();
        registry.register_fn("flaky", |_params, ctx| async move {
            Err(TaskError::connection(format!("{} unreachable", ctx.task_name)))
        });
        let err = registry
            .get("flaky")
            .unwrap()
            .handle(Parameters::new(), context("flaky"))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::connection("flaky unreachable"));
    }

    #[test]
    fn test_lookup_and_replacement() {
        let registry = TaskHandlerRegistry::new();
        assert!(registry.get("missing").is_none());
        registry.register("b", Arc::new(EchoHandler));
        registry.register("a", Arc::new(EchoHandler));
        registry.register("a", Arc::new(EchoHandler));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.stats().task_names, vec!["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(!registry.contains("a"));
    }
}
