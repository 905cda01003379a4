//! Workflow definition validation
//!
//! Checks run before any state is created for a workflow: unique task names,
//! dependencies that resolve, an acyclic dependency graph, sane limits, and
//! bounded task parameters.

use crate::constants::limits::{MAX_PARAMETER_BYTES, MAX_PARAMETER_DEPTH, MAX_TASK_NAME_LENGTH};
use crate::error::{OrchestratorError, Result};
use crate::models::{Parameters, WorkflowConfig};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

fn invalid(message: String) -> OrchestratorError {
    OrchestratorError::InvalidWorkflowConfig(message)
}

/// Validate a workflow definition
pub fn validate_workflow_config(config: &WorkflowConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty".to_string()));
    }
    if config.tasks.is_empty() {
        return Err(invalid(format!(
            "workflow '{}' defines no tasks",
            config.name
        )));
    }
    if config.max_concurrent_tasks == 0 {
        return Err(invalid(format!(
            "workflow '{}' must allow at least one concurrent task",
            config.name
        )));
    }
    if config.overall_timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid(format!(
            "workflow '{}' has a zero overall timeout",
            config.name
        )));
    }

    let mut names = HashSet::with_capacity(config.tasks.len());
    let mut ids = HashSet::with_capacity(config.tasks.len());
    for task in &config.tasks {
        if task.name.trim().is_empty() {
            return Err(invalid("task name must not be empty".to_string()));
        }
        if task.name.len() > MAX_TASK_NAME_LENGTH {
            return Err(invalid(format!(
                "task name '{}' is longer than {MAX_TASK_NAME_LENGTH} characters",
                task.name
            )));
        }
        if !names.insert(task.name.as_str()) {
            return Err(invalid(format!("duplicate task name '{}'", task.name)));
        }
        if !ids.insert(task.id.as_str()) {
            return Err(invalid(format!("duplicate task id '{}'", task.id)));
        }
        if task.timeout.is_zero() {
            return Err(invalid(format!("task '{}' has a zero timeout", task.name)));
        }
        task.retry_policy.validate().map_err(|e| match e {
            OrchestratorError::InvalidWorkflowConfig(msg) => {
                invalid(format!("task '{}': {msg}", task.name))
            }
            other => other,
        })?;
        validate_parameters(&task.parameters)
            .map_err(|e| invalid(format!("task '{}': {e}", task.name)))?;
    }

    for task in &config.tasks {
        let mut seen = HashSet::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            if !seen.insert(dep.as_str()) {
                return Err(invalid(format!(
                    "task '{}' lists dependency '{dep}' more than once",
                    task.name
                )));
            }
            if dep == &task.name {
                return Err(invalid(format!("task '{}' depends on itself", task.name)));
            }
            if !names.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "task '{}' depends on undefined task '{dep}'",
                    task.name
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(config) {
        return Err(invalid(format!(
            "circular dependency detected: {}",
            cycle.join(" -> ")
        )));
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search over dependency edges; returns the first cycle found
/// as a closed path of task names.
pub fn find_cycle(config: &WorkflowConfig) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = config
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; config.tasks.len()];
    let mut path: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        config: &WorkflowConfig,
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for dep in &config.tasks[node].dependencies {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .map(|&n| config.tasks[n].name.clone())
                        .collect();
                    cycle.push(config.tasks[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, config, index, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    for node in 0..config.tasks.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, config, &index, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn ordering of task names; ties keep definition order
pub fn topological_order(config: &WorkflowConfig) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = config
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), t.dependencies.len()))
        .collect();
    let mut ready: Vec<&str> = config
        .tasks
        .iter()
        .filter(|t| t.dependencies.is_empty())
        .map(|t| t.name.as_str())
        .collect();
    let mut order = Vec::with_capacity(config.tasks.len());

    while !ready.is_empty() {
        let name = ready.remove(0);
        order.push(name.to_string());
        for dependent in config.dependents_of(name) {
            if let Some(degree) = in_degree.get_mut(dependent.name.as_str()) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.push(dependent.name.as_str());
                }
            }
        }
    }

    if order.len() != config.tasks.len() {
        return Err(invalid(format!(
            "workflow '{}' has circular or unresolved dependencies",
            config.name
        )));
    }
    Ok(order)
}

/// Bound the size and nesting of task parameters
pub fn validate_parameters(parameters: &Parameters) -> std::result::Result<(), String> {
    let serialized =
        serde_json::to_string(parameters).map_err(|e| format!("invalid parameters: {e}"))?;
    if serialized.len() > MAX_PARAMETER_BYTES {
        return Err(format!(
            "parameters too large: {} bytes (max: {MAX_PARAMETER_BYTES})",
            serialized.len()
        ));
    }
    for value in parameters.values() {
        check_depth(value, 1)?;
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize) -> std::result::Result<(), String> {
    if depth > MAX_PARAMETER_DEPTH {
        return Err(format!(
            "parameters nested too deep: {depth} (max: {MAX_PARAMETER_DEPTH})"
        ));
    }
    match value {
        Value::Object(map) => map.values().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Array(items) => items.iter().try_for_each(|v| check_depth(v, depth + 1)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskDefinition;
    use serde_json::json;
    use std::time::Duration;

    fn chain() -> WorkflowConfig {
        WorkflowConfig::new("chain")
            .with_task(TaskDefinition::new("a"))
            .with_task(TaskDefinition::new("b").depends_on(["a"]))
            .with_task(TaskDefinition::new("c").depends_on(["b"]))
    }

    #[test]
    fn test_valid_chain() {
        assert!(validate_workflow_config(&chain()).is_ok());
        assert_eq!(topological_order(&chain()).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let config = WorkflowConfig::new("cyclic")
            .with_task(TaskDefinition::new("a").depends_on(["b"]))
            .with_task(TaskDefinition::new("b").depends_on(["a"]));
        let err = validate_workflow_config(&config).unwrap_err();
        let OrchestratorError::InvalidWorkflowConfig(msg) = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(msg.contains("circular dependency"), "{msg}");
        assert!(msg.contains("a -> b -> a"), "{msg}");
        assert!(topological_order(&config).is_err());
    }

    #[test]
    fn test_undefined_dependency() {
        let config = WorkflowConfig::new("broken")
            .with_task(TaskDefinition::new("a").depends_on(["ghost"]));
        let err = validate_workflow_config(&config).unwrap_err();
        assert!(err.to_string().contains("undefined task 'ghost'"));
    }

    #[test]
    fn test_self_dependency() {
        let config =
            WorkflowConfig::new("selfish").with_task(TaskDefinition::new("a").depends_on(["a"]));
        assert!(validate_workflow_config(&config)
            .unwrap_err()
            .to_string()
            .contains("depends on itself"));
    }

    #[test]
    fn test_duplicate_names_and_empty_config() {
        let config = WorkflowConfig::new("dupes")
            .with_task(TaskDefinition::new("a"))
            .with_task(TaskDefinition::new("a").with_id("other"));
        assert!(validate_workflow_config(&config).is_err());
        assert!(validate_workflow_config(&WorkflowConfig::new("empty")).is_err());
    }

    #[test]
    fn test_limits() {
        let config = chain().with_max_concurrent_tasks(0);
        assert!(validate_workflow_config(&config).is_err());

        let config = chain().with_overall_timeout(Some(Duration::ZERO));
        assert!(validate_workflow_config(&config).is_err());
    }

    #[test]
    fn test_parameter_depth() {
        let mut nested = json!("leaf");
        for _ in 0..12 {
            nested = json!({ "inner": nested });
        }
        let mut params = Parameters::new();
        params.insert("deep".to_string(), nested);
        assert!(validate_parameters(&params).is_err());

        let mut shallow = Parameters::new();
        shallow.insert("files".to_string(), json!(["a.rs", "b.rs"]));
        assert!(validate_parameters(&shallow).is_ok());
    }
}
