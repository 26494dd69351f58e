//! Durable workflow state.
//!
//! Both implementations share the transition rules in [`apply_update`], so a
//! task row moves forward only, and its result or failure record is written
//! together with the terminal status change.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryWorkflowStore;
pub use sqlite::SqliteWorkflowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorError;
use crate::models::{
    AgentFailure, AgentResult, AgentTask, HumanFeedback, Proposal, TaskStatus, Workflow,
    WorkflowOutcome, WorkflowStatus, WorkflowSummary,
};

/// A single forward transition of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Dispatch (attempt 1) or re-dispatch after a retryable failure.
    Running { attempt: u32 },
    Succeeded(AgentResult),
    Failed(AgentFailure),
    Skipped { reason: String },
}

impl TaskUpdate {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Running { .. } => TaskStatus::Running,
            Self::Succeeded(_) => TaskStatus::Succeeded,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Skipped { .. } => TaskStatus::Skipped,
        }
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a proposal and its freshly planned workflow.
    async fn create(&self, proposal: &Proposal, workflow: &Workflow) -> Result<(), OrchestratorError>;

    /// Full workflow with plan, results, failures and feedback.
    async fn get(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError>;

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, OrchestratorError>;

    /// Flip Pending to Running. Returns false if the workflow had already left Pending.
    async fn mark_running(&self, workflow_id: &str) -> Result<bool, OrchestratorError>;

    /// Apply one task transition; returns the task as stored afterwards.
    async fn update_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<AgentTask, OrchestratorError>;

    /// Record the terminal status and recommendation.
    ///
    /// Returns false when the workflow is already terminal, so at most one
    /// caller ever finalizes. Fails with `Conflict` while any task is unfinished.
    async fn finalize(
        &self,
        workflow_id: &str,
        outcome: &WorkflowOutcome,
    ) -> Result<bool, OrchestratorError>;

    /// Append feedback; the store assigns the sequence number.
    async fn append_feedback(
        &self,
        workflow_id: &str,
        feedback: HumanFeedback,
    ) -> Result<HumanFeedback, OrchestratorError>;

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, OrchestratorError>;

    /// Newest first. Returns `(page, total_matching)`.
    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowSummary>, usize), OrchestratorError>;
}

/// Validate and apply a transition to an in-memory copy of the task row.
pub(crate) fn apply_update(
    task: &mut AgentTask,
    update: &TaskUpdate,
    now: DateTime<Utc>,
) -> Result<(), OrchestratorError> {
    let next = update.status();
    if !task.status.can_transition_to(next) {
        return Err(OrchestratorError::Conflict(format!(
            "task {} cannot move from {} to {}",
            task.id,
            task.status.as_str(),
            next.as_str()
        )));
    }

    match update {
        TaskUpdate::Running { attempt } => {
            if *attempt == 0 || *attempt <= task.attempts {
                return Err(OrchestratorError::Conflict(format!(
                    "task {} attempt {} does not follow attempt {}",
                    task.id, attempt, task.attempts
                )));
            }
            task.attempts = *attempt;
            task.started_at.get_or_insert(now);
        }
        TaskUpdate::Succeeded(result) => {
            ensure_same_task(task, &result.task_id)?;
            task.finished_at = Some(now);
        }
        TaskUpdate::Failed(failure) => {
            ensure_same_task(task, &failure.task_id)?;
            task.attempts = task.attempts.max(failure.attempts);
            task.finished_at = Some(now);
        }
        TaskUpdate::Skipped { reason } => {
            task.skip_reason = Some(reason.clone());
            task.finished_at = Some(now);
        }
    }
    task.status = next;
    Ok(())
}

fn ensure_same_task(task: &AgentTask, record_task_id: &str) -> Result<(), OrchestratorError> {
    if task.id != record_task_id {
        return Err(OrchestratorError::BadRequest(format!(
            "record for task {} cannot be stored on task {}",
            record_task_id, task.id
        )));
    }
    Ok(())
}

pub(crate) fn ensure_terminal_outcome(outcome: &WorkflowOutcome) -> Result<(), OrchestratorError> {
    if !outcome.status.is_terminal() {
        return Err(OrchestratorError::BadRequest(format!(
            "cannot finalize a workflow as {}",
            outcome.status
        )));
    }
    Ok(())
}
