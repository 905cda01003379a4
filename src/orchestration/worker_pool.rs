//! Worker pool for task execution
//!
//! A fixed number of worker slots pull ready items from the shared
//! [`PriorityTaskQueue`], run the registered handler under the task timeout, and
//! report the outcome through a [`TaskLifecycle`]. Handlers run on their own
//! tokio task so that a timeout or cancellation aborts them and frees the slot,
//! and a panicking handler is reported as a task error instead of killing the
//! worker.

use crate::config::WorkerPoolConfig;
use crate::models::TaskItem;
use crate::orchestration::errors::{TaskError, TaskResult};
use crate::orchestration::task_queue::PriorityTaskQueue;
use crate::registry::{TaskContext, TaskHandler, TaskHandlerRegistry};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callbacks invoked by worker slots around each task execution
#[async_trait]
pub trait TaskLifecycle: Send + Sync {
    /// Called after an item is dequeued. Returning `None` drops the item
    /// without running it (for example when its workflow is no longer running).
    async fn on_task_started(&self, item: &TaskItem) -> Option<TaskContext>;

    async fn on_task_completed(&self, item: TaskItem, result: Value);

    /// The item is still in `running` status; the callee decides what it becomes.
    async fn on_task_failed(&self, item: TaskItem, error: TaskError);
}

/// Running set of worker slots
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    busy: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.handles.len())
            .field("busy", &self.busy_workers())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `config.worker_count` slots on the current runtime
    pub fn start(
        config: WorkerPoolConfig,
        queue: Arc<PriorityTaskQueue>,
        registry: Arc<TaskHandlerRegistry>,
        lifecycle: Arc<dyn TaskLifecycle>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let busy = Arc::new(AtomicUsize::new(0));
        let worker_count = config.worker_count.max(1);

        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    queue: Arc::clone(&queue),
                    registry: Arc::clone(&registry),
                    lifecycle: Arc::clone(&lifecycle),
                    shutdown: shutdown.clone(),
                    idle_poll_interval: config.idle_poll_interval(),
                    busy: Arc::clone(&busy),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(worker_count, "Worker pool started");
        Self {
            config,
            shutdown,
            handles,
            busy,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Slots currently executing a task
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop taking new work and wait for in-flight tasks
    ///
    /// All slots share one grace period; slots still busy after it are aborted.
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        self.shutdown.cancel();

        let grace = self.config.shutdown_timeout();
        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, join_all(self.handles)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    if !e.is_cancelled() {
                        error!(error = %e, "Worker task panicked");
                    }
                }
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Workers did not stop in time; aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    worker_id: usize,
    queue: Arc<PriorityTaskQueue>,
    registry: Arc<TaskHandlerRegistry>,
    lifecycle: Arc<dyn TaskLifecycle>,
    shutdown: CancellationToken,
    idle_poll_interval: Duration,
    busy: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.worker_id, "Worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.dequeue_ready() {
                Some(item) => {
                    self.busy.fetch_add(1, Ordering::Relaxed);
                    self.execute(item).await;
                    self.busy.fetch_sub(1, Ordering::Relaxed);
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.idle_poll_interval) => {}
                    }
                }
            }
        }
        debug!(worker_id = self.worker_id, "Worker stopped");
    }

    async fn execute(&self, mut item: TaskItem) {
        let workflow_id = item.workflow_id;
        let Some(context) = self.lifecycle.on_task_started(&item).await else {
            debug!(
                worker_id = self.worker_id,
                workflow_id = %workflow_id,
                task_name = %item.name(),
                "Dropped task for inactive workflow"
            );
            self.queue.task_finished(workflow_id);
            return;
        };

        let outcome = match self.registry.get(item.name()) {
            Some(handler) => self.invoke(handler, &item, context).await,
            None => Err(TaskError::missing_handler(item.name())),
        };
        self.queue.task_finished(workflow_id);

        match outcome {
            Ok(result) => {
                if let Err(e) = item.transition(TaskStatus::Completed) {
                    warn!(task_name = %item.name(), error = %e, "Unexpected task status on completion");
                }
                self.lifecycle.on_task_completed(item, result).await;
            }
            Err(error) => {
                item.error_message = Some(error.to_string());
                self.lifecycle.on_task_failed(item, error).await;
            }
        }
    }

    async fn invoke(
        &self,
        handler: Arc<dyn TaskHandler>,
        item: &TaskItem,
        context: TaskContext,
    ) -> TaskResult<Value> {
        let task_name = item.name().to_string();
        let timeout = item.definition.timeout;
        let cancellation = context.cancellation.clone();
        let parameters = item.definition.parameters.clone();

        debug!(
            worker_id = self.worker_id,
            workflow_id = %item.workflow_id,
            task_name = %task_name,
            attempt = item.attempt_number(),
            "Executing task"
        );

        let mut handle = tokio::spawn(async move { handler.handle(parameters, context).await });
        let abort = handle.abort_handle();

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                abort.abort();
                Err(TaskError::cancelled(&task_name))
            }
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    error!(task_name = %task_name, error = %join_error, "Task handler panicked");
                    Err(TaskError::other(
                        "panic",
                        format!("handler for '{task_name}' panicked: {join_error}"),
                    ))
                }
                Err(_) => {
                    abort.abort();
                    warn!(task_name = %task_name, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                    Err(TaskError::timed_out(&task_name, timeout))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Parameters, TaskDefinition, WorkflowId};
    use parking_lot::Mutex;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingLifecycle {
        completed: Mutex<Vec<(String, Value)>>,
        failed: Mutex<Vec<(String, TaskError)>>,
        cancellation: CancellationToken,
    }

    #[async_trait]
    impl TaskLifecycle for RecordingLifecycle {
        async fn on_task_started(&self, item: &TaskItem) -> Option<TaskContext> {
            Some(TaskContext {
                workflow_id: item.workflow_id,
                review_id: "review".to_string(),
                task_name: item.name().to_string(),
                attempt: item.attempt_number(),
                dependency_results: Parameters::new(),
                cancellation: self.cancellation.child_token(),
            })
        }

        async fn on_task_completed(&self, item: TaskItem, result: Value) {
            self.completed.lock().push((item.name().to_string(), result));
        }

        async fn on_task_failed(&self, item: TaskItem, error: TaskError) {
            self.failed.lock().push((item.name().to_string(), error));
        }
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 2,
            idle_poll_interval_ms: 5,
            ..WorkerPoolConfig::default()
        }
    }

    fn setup() -> (Arc<PriorityTaskQueue>, Arc<TaskHandlerRegistry>, WorkflowId) {
        let queue = Arc::new(PriorityTaskQueue::new());
        let workflow_id = Uuid::new_v4();
        queue.register_workflow(workflow_id, 5, Vec::new());
        (queue, Arc::new(TaskHandlerRegistry::new()), workflow_id)
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_executes_handler_and_reports_completion() {
        let (queue, registry, wf) = setup();
        registry.register_fn("lint", |_p, _c| async { Ok(json!({"issues": 0})) });
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let pool = WorkerPool::start(config(), queue.clone(), registry, lifecycle.clone());

        queue
            .enqueue(TaskItem::new(wf, Arc::new(TaskDefinition::new("lint"))))
            .unwrap();
        wait_until(|| !lifecycle.completed.lock().is_empty()).await;

        assert_eq!(lifecycle.completed.lock()[0], ("lint".to_string(), json!({"issues": 0})));
        assert_eq!(queue.running_for(wf), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_reports_timeout_error() {
        let (queue, registry, wf) = setup();
        registry.register_fn("slow", |_p, _c| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let pool = WorkerPool::start(config(), queue.clone(), registry, lifecycle.clone());

        let def = TaskDefinition::new("slow").with_timeout(Duration::from_millis(20));
        queue.enqueue(TaskItem::new(wf, Arc::new(def))).unwrap();
        wait_until(|| !lifecycle.failed.lock().is_empty()).await;

        let (name, error) = lifecycle.failed.lock()[0].clone();
        assert_eq!(name, "slow");
        assert_eq!(error.kind, crate::orchestration::errors::ErrorKind::Timeout);
        assert_eq!(queue.running_for(wf), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_handler_and_panics_are_reported() {
        let (queue, registry, wf) = setup();
        registry.register_fn("explode", |_p, _c| async {
            if true {
                panic!("boom");
            }
            Ok(Value::Null)
        });
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let pool = WorkerPool::start(config(), queue.clone(), registry, lifecycle.clone());

        queue
            .enqueue(TaskItem::new(wf, Arc::new(TaskDefinition::new("ghost"))))
            .unwrap();
        queue
            .enqueue(TaskItem::new(wf, Arc::new(TaskDefinition::new("explode"))))
            .unwrap();
        wait_until(|| lifecycle.failed.lock().len() == 2).await;

        let failed = lifecycle.failed.lock().clone();
        let kinds: Vec<&str> = failed.iter().map(|(_, e)| e.kind_name()).collect();
        assert!(kinds.contains(&"missing_handler"));
        assert!(kinds.contains(&"panic"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancellation_aborts_running_handler() {
        let (queue, registry, wf) = setup();
        registry.register_fn("wait", |_p, _c| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let pool = WorkerPool::start(config(), queue.clone(), registry, lifecycle.clone());

        queue
            .enqueue(TaskItem::new(wf, Arc::new(TaskDefinition::new("wait"))))
            .unwrap();
        wait_until(|| pool.busy_workers() == 1).await;
        lifecycle.cancellation.cancel();
        wait_until(|| !lifecycle.failed.lock().is_empty()).await;

        assert_eq!(
            lifecycle.failed.lock()[0].1.kind,
            crate::orchestration::errors::ErrorKind::Cancelled
        );
        pool.shutdown().await;
    }
}
