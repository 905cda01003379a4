use super::{Parameters, WorkflowId};
use crate::constants::step_data::WARNINGS_KEY;
use crate::state_machine::{validate_transition, StateMachineError, StateMachineResult, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Mutable runtime record of one workflow instance
///
/// `completed_steps` and `failed_steps` are kept disjoint. Once the status is
/// terminal every mutating method returns [`StateMachineError::TerminalState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub review_id: String,
    pub config_name: String,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    /// Task retries scheduled across the lifetime of the workflow
    pub retry_count: u32,
    pub step_data: Parameters,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(
        review_id: impl Into<String>,
        config_name: impl Into<String>,
        initial_step: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::new_v4(),
            review_id: review_id.into(),
            config_name: config_name.into(),
            status: WorkflowStatus::Pending,
            current_step: initial_step,
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            retry_count: 0,
            step_data: Parameters::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn ensure_mutable(&self) -> StateMachineResult<()> {
        if self.status.is_terminal() {
            return Err(StateMachineError::TerminalState(self.status));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Validate and apply a status change, returning the previous status
    ///
    /// `started_at` is stamped on the first move to running; `completed_at` on
    /// every move to completed, failed or cancelled.
    pub fn transition_to(&mut self, to: WorkflowStatus) -> StateMachineResult<WorkflowStatus> {
        validate_transition(self.status, to)?;
        let from = self.status;
        let now = Utc::now();
        match to {
            WorkflowStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = None;
            }
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            WorkflowStatus::Pending | WorkflowStatus::Retrying => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(from)
    }

    pub fn set_current_step(&mut self, step: impl Into<String>) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        self.current_step = Some(step.into());
        self.touch();
        Ok(())
    }

    /// Record `step` as completed and merge its result under the step name
    pub fn advance_step(&mut self, step: &str, result: Option<Value>) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        self.failed_steps.remove(step);
        self.completed_steps.insert(step.to_string());
        if let Some(result) = result {
            self.step_data.insert(step.to_string(), result);
        }
        if self.current_step.as_deref() == Some(step) {
            self.current_step = None;
        }
        self.touch();
        Ok(())
    }

    /// Count a skipped step as completed and attach a warning instead of a result
    pub fn skip_step(&mut self, step: &str, warning: &str) -> StateMachineResult<()> {
        self.advance_step(step, None)?;
        let warnings = self
            .step_data
            .entry(WARNINGS_KEY.to_string())
            .or_insert_with(|| Value::Object(Parameters::new()));
        if let Value::Object(map) = warnings {
            map.insert(step.to_string(), Value::String(warning.to_string()));
        }
        Ok(())
    }

    pub fn mark_step_failed(&mut self, step: &str, error: &str) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        // A step that already completed is never re-run, so it cannot fail later.
        if !self.completed_steps.contains(step) {
            self.failed_steps.insert(step.to_string());
        }
        self.error_message = Some(error.to_string());
        self.touch();
        Ok(())
    }

    /// Forget failed steps so they are scheduled again after a restart
    pub fn clear_failures(&mut self) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        self.failed_steps.clear();
        self.error_message = None;
        self.touch();
        Ok(())
    }

    pub fn increment_retry_count(&mut self) -> StateMachineResult<u32> {
        self.ensure_mutable()?;
        self.retry_count += 1;
        self.touch();
        Ok(self.retry_count)
    }

    pub fn merge_step_data(&mut self, data: Parameters) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        self.step_data.extend(data);
        self.touch();
        Ok(())
    }

    pub fn set_error_message(&mut self, message: Option<String>) -> StateMachineResult<()> {
        self.ensure_mutable()?;
        self.error_message = message;
        self.touch();
        Ok(())
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.contains(step)
    }

    /// Results of the named steps, for handing upstream output to a dependent task
    pub fn results_for<'a, I>(&self, steps: I) -> Parameters
    where
        I: IntoIterator<Item = &'a String>,
    {
        steps
            .into_iter()
            .filter_map(|step| {
                self.step_data
                    .get(step)
                    .map(|value| (step.clone(), value.clone()))
            })
            .collect()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
