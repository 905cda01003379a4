use super::task_definition::TaskDefinition;
use crate::constants::workflow_defaults;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Definition of a workflow: its tasks and execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<TaskDefinition>,
    /// Upper bound on tasks of this workflow running at the same time
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Deadline for the whole workflow; `None` disables the watchdog
    #[serde(
        rename = "overall_timeout_seconds",
        default = "default_overall_timeout",
        with = "crate::utils::serde::option_duration_secs"
    )]
    pub overall_timeout: Option<Duration>,
}

fn default_max_concurrent_tasks() -> usize {
    workflow_defaults::MAX_CONCURRENT_TASKS
}

fn default_overall_timeout() -> Option<Duration> {
    Some(workflow_defaults::OVERALL_TIMEOUT)
}

impl WorkflowConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tasks: Vec::new(),
            max_concurrent_tasks: workflow_defaults::MAX_CONCURRENT_TASKS,
            overall_timeout: Some(workflow_defaults::OVERALL_TIMEOUT),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    /// Tasks with no dependencies
    pub fn root_tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter().filter(|t| !t.has_dependencies())
    }

    /// Tasks that list `name` as a dependency
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TaskDefinition> {
        self.tasks
            .iter()
            .filter(move |t| t.dependencies.iter().any(|d| d == name))
    }

    pub fn validate(&self) -> Result<()> {
        crate::validation::validate_workflow_config(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
