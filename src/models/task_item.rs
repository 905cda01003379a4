use super::task_definition::{TaskDefinition, TaskPriority};
use super::WorkflowId;
use crate::state_machine::{StateMachineError, TaskStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// A scheduled instance of a [`TaskDefinition`] belonging to one workflow
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub definition: Arc<TaskDefinition>,
    pub status: TaskStatus,
    /// Retries already consumed; the current attempt number is `retry_count + 1`
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Enqueue order, assigned by the queue; breaks priority ties FIFO
    pub(crate) sequence: u64,
}

impl TaskItem {
    pub fn new(workflow_id: WorkflowId, definition: Arc<TaskDefinition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            definition,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            sequence: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn priority(&self) -> TaskPriority {
        self.definition.priority
    }

    pub fn attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_ready<F>(&self, completed: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        self.status.is_schedulable() && self.definition.dependencies_satisfied(completed)
    }

    /// Move the item to `to`, stamping start and completion times
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), StateMachineError> {
        if !self.status.can_transition_to(to) {
            return Err(StateMachineError::InvalidTaskTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        match to {
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            TaskStatus::Retrying => {
                self.completed_at = Some(now);
                self.retry_count += 1;
            }
            TaskStatus::Pending => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn execution_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> TaskItem {
        TaskItem::new(Uuid::new_v4(), Arc::new(TaskDefinition::new(name)))
    }

    #[test]
    fn test_running_stamps_start_time() {
        let mut item = item("lint");
        item.transition(TaskStatus::Running).unwrap();
        assert!(item.started_at.is_some());
        assert!(item.completed_at.is_none());
        item.transition(TaskStatus::Completed).unwrap();
        assert!(item.execution_time().is_some());
    }

    #[test]
    fn test_retry_increments_count_and_allows_rerun() {
        let mut item = item("lint");
        item.transition(TaskStatus::Running).unwrap();
        item.transition(TaskStatus::Retrying).unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.attempt_number(), 2);
        item.transition(TaskStatus::Running).unwrap();
        assert_eq!(item.status, TaskStatus::Running);
    }

    #[test]
    fn test_completed_item_cannot_restart() {
        let mut item = item("lint");
        item.transition(TaskStatus::Running).unwrap();
        item.transition(TaskStatus::Completed).unwrap();
        assert!(item.transition(TaskStatus::Running).is_err());
    }
}
