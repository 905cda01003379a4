//! # Priority Task Queue
//!
//! In-memory queue shared by every workflow. Items are ordered by priority
//! (highest first) and then by enqueue order. An item is only handed out when:
//!
//! - every dependency of its task has completed within its workflow, and
//! - its workflow is below its `max_concurrent_tasks` limit.
//!
//! Items that fail either check stay queued and are re-examined on the next
//! dequeue. All operations take a short synchronous lock; workers waiting for
//! work park on a [`Notify`].

use crate::models::{TaskItem, WorkflowId};
use crate::state_machine::TaskStatus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Workflow {0} is not registered with the queue")]
    UnknownWorkflow(WorkflowId),

    #[error("Workflow {0} has been cancelled; no new tasks are accepted")]
    WorkflowCancelled(WorkflowId),

    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task item {item_id} is in status {status} and cannot be queued")]
    NotSchedulable { item_id: Uuid, status: TaskStatus },
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items waiting in the queue
    pub queued: usize,
    /// Queued items whose dependencies and concurrency limit allow them to run now
    pub ready: usize,
    /// Queued items held back by dependencies or concurrency limits
    pub blocked: usize,
    /// Items handed to workers and not yet reported finished
    pub running: usize,
    /// Steps recorded as completed across registered workflows
    pub completed: usize,
    pub workflows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    sequence: u64,
    item_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct WorkflowSlot {
    max_concurrent: usize,
    running: usize,
    completed: HashSet<String>,
    cancelled: bool,
}

impl WorkflowSlot {
    fn admits(&self, item: &TaskItem) -> bool {
        !self.cancelled
            && self.running < self.max_concurrent
            && item.is_ready(|dep| self.completed.contains(dep))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    items: HashMap<Uuid, TaskItem>,
    workflows: HashMap<WorkflowId, WorkflowSlot>,
}

enum Verdict {
    Take,
    Hold,
    Discard,
}

#[derive(Debug)]
pub struct PriorityTaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    sequence: AtomicU64,
    capacity: Option<usize>,
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Queue that rejects enqueues beyond `capacity` waiting items
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            capacity,
        }
    }

    /// Start accepting tasks for a workflow
    ///
    /// Re-registering a workflow (after a restart) clears its cancelled flag and
    /// replaces its completed-step set; in-flight counts are preserved.
    pub fn register_workflow<I>(&self, workflow_id: WorkflowId, max_concurrent: usize, completed: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut inner = self.inner.lock();
        let slot = inner
            .workflows
            .entry(workflow_id)
            .or_insert_with(|| WorkflowSlot {
                max_concurrent,
                running: 0,
                completed: HashSet::new(),
                cancelled: false,
            });
        slot.max_concurrent = max_concurrent.max(1);
        slot.cancelled = false;
        slot.completed = completed.into_iter().collect();
    }

    /// Insert an item; it is held until its dependencies are satisfied
    pub fn enqueue(&self, mut item: TaskItem) -> Result<(), QueueError> {
        if !item.status.is_schedulable() {
            return Err(QueueError::NotSchedulable {
                item_id: item.id,
                status: item.status,
            });
        }
        {
            let mut inner = self.inner.lock();
            match inner.workflows.get(&item.workflow_id) {
                None => return Err(QueueError::UnknownWorkflow(item.workflow_id)),
                Some(slot) if slot.cancelled => {
                    return Err(QueueError::WorkflowCancelled(item.workflow_id))
                }
                Some(_) => {}
            }
            if let Some(capacity) = self.capacity {
                if inner.items.len() >= capacity {
                    return Err(QueueError::QueueFull { capacity });
                }
            }

            item.sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            let entry = QueueEntry {
                priority: item.priority().value(),
                sequence: item.sequence,
                item_id: item.id,
            };
            debug!(
                workflow_id = %item.workflow_id,
                task_name = %item.name(),
                priority = %item.priority(),
                "Enqueued task"
            );
            inner.items.insert(item.id, item);
            inner.heap.push(entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the highest priority item that may run now
    ///
    /// The returned item is already marked running and counts against its
    /// workflow's concurrency limit until [`task_finished`](Self::task_finished).
    pub fn dequeue_ready(&self) -> Option<TaskItem> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut held = Vec::new();
        let mut taken = None;

        while let Some(entry) = inner.heap.pop() {
            let verdict = match inner.items.get(&entry.item_id) {
                // Entry left behind by a cancelled or removed item.
                None => continue,
                Some(item) => match inner.workflows.get(&item.workflow_id) {
                    None => Verdict::Discard,
                    Some(slot) if slot.cancelled => Verdict::Discard,
                    Some(slot) if slot.admits(item) => Verdict::Take,
                    Some(_) => Verdict::Hold,
                },
            };
            match verdict {
                Verdict::Take => {
                    taken = inner.items.remove(&entry.item_id);
                    break;
                }
                Verdict::Hold => held.push(entry),
                Verdict::Discard => {
                    inner.items.remove(&entry.item_id);
                }
            }
        }
        inner.heap.extend(held);

        let mut item = taken?;
        if let Some(slot) = inner.workflows.get_mut(&item.workflow_id) {
            slot.running += 1;
        }
        if let Err(e) = item.transition(TaskStatus::Running) {
            warn!(task_name = %item.name(), error = %e, "Unexpected task status at dequeue");
        }
        Some(item)
    }

    /// Wait until new work may be available or `timeout` elapses
    pub async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }

    /// Release the concurrency slot held by a dequeued item
    pub fn task_finished(&self, workflow_id: WorkflowId) {
        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.workflows.get_mut(&workflow_id) {
                slot.running = slot.running.saturating_sub(1);
            }
        }
        self.notify.notify_one();
    }

    /// Record a completed step so dependents become eligible
    pub fn mark_step_completed(&self, workflow_id: WorkflowId, step: &str) {
        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.workflows.get_mut(&workflow_id) {
                slot.completed.insert(step.to_string());
            }
        }
        self.notify.notify_one();
    }

    /// Drop every waiting item of a workflow and refuse further enqueues
    pub fn cancel_workflow(&self, workflow_id: WorkflowId) -> Vec<TaskItem> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.workflows.get_mut(&workflow_id) {
            slot.cancelled = true;
        }
        let ids: Vec<Uuid> = inner
            .items
            .values()
            .filter(|item| item.workflow_id == workflow_id)
            .map(|item| item.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| inner.items.remove(&id))
            .map(|mut item| {
                if let Err(e) = item.transition(TaskStatus::Cancelled) {
                    warn!(task_name = %item.name(), error = %e, "Unexpected task status at cancel");
                }
                item
            })
            .collect()
    }

    /// Forget a finished workflow entirely
    pub fn remove_workflow(&self, workflow_id: WorkflowId) {
        let mut inner = self.inner.lock();
        inner.workflows.remove(&workflow_id);
        inner.items.retain(|_, item| item.workflow_id != workflow_id);
    }

    pub fn queued_for(&self, workflow_id: WorkflowId) -> usize {
        self.inner
            .lock()
            .items
            .values()
            .filter(|item| item.workflow_id == workflow_id)
            .count()
    }

    pub fn running_for(&self, workflow_id: WorkflowId) -> usize {
        self.inner
            .lock()
            .workflows
            .get(&workflow_id)
            .map_or(0, |slot| slot.running)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Workflows with a registered slot
    pub fn workflow_count(&self) -> usize {
        self.inner.lock().workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let ready = inner
            .items
            .values()
            .filter(|item| {
                inner
                    .workflows
                    .get(&item.workflow_id)
                    .is_some_and(|slot| slot.admits(item))
            })
            .count();
        QueueStats {
            queued: inner.items.len(),
            ready,
            blocked: inner.items.len() - ready,
            running: inner.workflows.values().map(|slot| slot.running).sum(),
            completed: inner.workflows.values().map(|slot| slot.completed.len()).sum(),
            workflows: inner.workflows.len(),
        }
    }
}
