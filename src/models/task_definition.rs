use super::retry_policy::RetryPolicy;
use super::Parameters;
use crate::constants::workflow_defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Scheduling priority; higher values are dequeued first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    #[serde(alias = "normal")]
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A named unit of work inside a workflow
///
/// `name` doubles as the handler lookup key and as the step name recorded in
/// the workflow state. Dependencies refer to other tasks by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(
        rename = "timeout_seconds",
        default = "default_task_timeout",
        with = "crate::utils::serde::duration_secs"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parameters: Parameters,
    /// Non-critical tasks are skipped instead of failing the workflow
    #[serde(default)]
    pub skip_on_failure: bool,
}

fn default_task_timeout() -> Duration {
    workflow_defaults::TASK_TIMEOUT
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            description: None,
            priority: TaskPriority::default(),
            timeout: workflow_defaults::TASK_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            dependencies: Vec::new(),
            parameters: Parameters::new(),
            skip_on_failure: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Mark the task as non-critical: an unrecoverable failure skips it
    pub fn skippable(mut self) -> Self {
        self.skip_on_failure = true;
        self
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// True when every dependency name is contained in `completed`
    pub fn dependencies_satisfied<F>(&self, mut completed: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        self.dependencies.iter().all(|dep| completed(dep.as_str()))
    }
}
