mod common;

use common::strategies::*;
use proptest::prelude::*;
use review_orchestrator::models::{BackoffStrategy, TaskDefinition, TaskItem, WorkflowState};
use review_orchestrator::orchestration::{compute_delay, should_retry, PriorityTaskQueue};
use review_orchestrator::state_machine::{can_transition, WorkflowStatus};
use review_orchestrator::validation::find_cycle;
use review_orchestrator::{ErrorKind, TaskError};
use std::sync::Arc;
use uuid::Uuid;

proptest! {
    /// Property: Generated acyclic dependency graphs always validate
    #[test]
    fn acyclic_workflows_validate(dependencies in acyclic_dependencies_strategy(10)) {
        let config = workflow_from_dependencies(&dependencies);
        prop_assert!(config.validate().is_ok(), "{:?}", dependencies);
        prop_assert!(config.root_tasks().next().is_some());
    }

    /// Property: A back edge anywhere in a chain is reported as a cycle
    #[test]
    fn cyclic_workflows_are_rejected(config in cyclic_workflow_strategy()) {
        prop_assert!(find_cycle(&config).is_some());
        prop_assert!(config.validate().is_err());
    }

    /// Property: Terminal statuses never transition anywhere
    #[test]
    fn terminal_statuses_are_final(from in workflow_status_strategy(), to in workflow_status_strategy()) {
        if from.is_terminal() {
            prop_assert!(!can_transition(from, to));
        }
    }

    /// Property: Applying random transitions never leaves a terminal status
    #[test]
    fn state_never_leaves_terminal(targets in prop::collection::vec(workflow_status_strategy(), 0..20)) {
        let mut state = WorkflowState::new("review", "config", None);
        let mut reached_terminal: Option<WorkflowStatus> = None;
        for to in targets {
            let allowed = can_transition(state.status, to);
            let result = state.transition_to(to);
            prop_assert_eq!(result.is_ok(), allowed);
            if let Some(terminal) = reached_terminal {
                prop_assert_eq!(state.status, terminal);
            } else if state.status.is_terminal() {
                reached_terminal = Some(state.status);
            }
        }
    }

    /// Property: Delays never exceed the policy cap
    #[test]
    fn backoff_is_capped(policy in retry_policy_strategy(), attempt in 1u32..64) {
        for strategy in [
            BackoffStrategy::Fixed,
            BackoffStrategy::Linear,
            BackoffStrategy::Exponential,
            BackoffStrategy::Jittered,
        ] {
            let policy = policy.clone().with_strategy(strategy);
            prop_assert!(compute_delay(&policy, attempt) <= policy.max_delay);
        }
    }

    /// Property: Exponential delays never shrink as attempts grow
    #[test]
    fn exponential_backoff_is_monotonic(policy in retry_policy_strategy(), attempt in 1u32..30) {
        let policy = policy.with_strategy(BackoffStrategy::Exponential);
        prop_assert!(compute_delay(&policy, attempt) <= compute_delay(&policy, attempt + 1));
    }

    /// Property: The number of attempts never exceeds max_attempts
    #[test]
    fn retries_stop_at_max_attempts(policy in retry_policy_strategy()) {
        let error = TaskError::new(ErrorKind::Temporary, "busy");
        let attempts = (1..=policy.max_attempts + 5)
            .take_while(|attempt| should_retry(&policy, &error, *attempt))
            .count() as u32
            + 1;
        prop_assert_eq!(attempts, policy.max_attempts);
    }

    /// Property: Ready items leave the queue in priority order, FIFO within a priority
    #[test]
    fn queue_dequeues_by_priority(priorities in prop::collection::vec(priority_strategy(), 1..30)) {
        let queue = PriorityTaskQueue::new();
        let workflow_id = Uuid::new_v4();
        queue.register_workflow(workflow_id, priorities.len(), std::iter::empty::<String>());
        for (i, priority) in priorities.iter().enumerate() {
            let definition = Arc::new(TaskDefinition::new(format!("t{i}")).with_priority(*priority));
            queue.enqueue(TaskItem::new(workflow_id, definition)).unwrap();
        }

        let mut previous: Option<(u8, usize)> = None;
        while let Some(item) = queue.dequeue_ready() {
            let index: usize = item.name()[1..].parse().unwrap();
            let key = (item.priority().value(), index);
            if let Some((prev_priority, prev_index)) = previous {
                prop_assert!(
                    key.0 < prev_priority || (key.0 == prev_priority && key.1 > prev_index),
                    "{:?} dequeued after {:?}", key, (prev_priority, prev_index)
                );
            }
            previous = Some(key);
        }
        prop_assert!(queue.is_empty());
    }

    /// Property: Fatal kinds are never retried
    #[test]
    fn fatal_errors_never_retry(policy in retry_policy_strategy(), attempt in 1u32..5) {
        for kind in [ErrorKind::Validation, ErrorKind::Contract, ErrorKind::MissingHandler, ErrorKind::Cancelled] {
            prop_assert!(!should_retry(&policy, &TaskError::new(kind, "fatal"), attempt));
        }
    }
}
