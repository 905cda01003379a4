use proptest::prelude::*;
use review_orchestrator::models::{RetryPolicy, TaskDefinition, TaskPriority, WorkflowConfig};
use review_orchestrator::state_machine::WorkflowStatus;
use std::time::Duration;

/// Strategy for generating valid task names
pub fn task_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

pub fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
    prop_oneof![
        Just(TaskPriority::Low),
        Just(TaskPriority::Medium),
        Just(TaskPriority::High),
        Just(TaskPriority::Critical),
    ]
}

pub fn workflow_status_strategy() -> impl Strategy<Value = WorkflowStatus> {
    prop::sample::select(WorkflowStatus::ALL.to_vec())
}

/// Dependency lists where task `i` only depends on tasks `< i`
pub fn acyclic_dependencies_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks).prop_flat_map(|count| {
        (0..count)
            .map(|i| prop::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
            .collect::<Vec<_>>()
    })
}

/// Build a workflow from index-based dependency lists
pub fn workflow_from_dependencies(dependencies: &[Vec<usize>]) -> WorkflowConfig {
    dependencies
        .iter()
        .enumerate()
        .fold(WorkflowConfig::new("generated"), |config, (i, deps)| {
            config.with_task(
                TaskDefinition::new(format!("task_{i}"))
                    .depends_on(deps.iter().map(|d| format!("task_{d}"))),
            )
        })
}

/// Acyclic dependencies plus one edge from an earlier task to a later one that
/// (transitively) depends on it, which closes a cycle
pub fn cyclic_workflow_strategy() -> impl Strategy<Value = WorkflowConfig> {
    (2..8usize).prop_flat_map(|len| {
        (Just(len), 0..len - 1).prop_map(|(len, from)| {
            // chain task_0 <- task_1 <- ... <- task_{len-1}, then task_from depends on the last
            let mut dependencies: Vec<Vec<usize>> =
                (0..len).map(|i| if i == 0 { vec![] } else { vec![i - 1] }).collect();
            dependencies[from].push(len - 1);
            workflow_from_dependencies(&dependencies)
        })
    })
}

pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..10, 1u64..5_000, 1.0f64..4.0, 1u64..600).prop_map(
        |(max_attempts, base_ms, multiplier, max_secs)| {
            RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_multiplier(multiplier)
                .with_max_delay(Duration::from_secs(max_secs))
        },
    )
}
