use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::{apply_update, ensure_terminal_outcome, TaskUpdate, WorkflowStore};
use crate::error::OrchestratorError;
use crate::models::{
    AgentFailure, AgentResult, AgentTask, HumanFeedback, Proposal, Workflow, WorkflowOutcome,
    WorkflowStatus, WorkflowSummary,
};

/// In-memory [`WorkflowStore`] for embedding and tests.
///
/// Uses `std::sync` locks (never held across `.await`). Each task row has
/// its own mutex so completions of sibling tasks never contend; the header
/// mutex guards the workflow-level status and feedback history.
pub struct InMemoryWorkflowStore {
    proposals: RwLock<HashMap<String, Proposal>>,
    workflows: RwLock<HashMap<String, Arc<Entry>>>,
    order: RwLock<Vec<String>>,
}

struct Entry {
    header: Mutex<Workflow>,
    tasks: Vec<Mutex<TaskRow>>,
}

struct TaskRow {
    task: AgentTask,
    result: Option<AgentResult>,
    failure: Option<AgentFailure>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> OrchestratorError {
    OrchestratorError::Internal(format!("Lock poisoned: {}", e))
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            proposals: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    fn entry(&self, workflow_id: &str) -> Result<Arc<Entry>, OrchestratorError> {
        let workflows = self.workflows.read().map_err(poisoned)?;
        workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {}", workflow_id)))
    }

    fn snapshot(entry: &Entry) -> Result<Workflow, OrchestratorError> {
        let mut wf = entry.header.lock().map_err(poisoned)?.clone();
        wf.plan.clear();
        wf.results.clear();
        wf.failures.clear();
        for row in &entry.tasks {
            let row = row.lock().map_err(poisoned)?;
            wf.plan.push(row.task.clone());
            if let Some(result) = &row.result {
                wf.results.push(result.clone());
            }
            if let Some(failure) = &row.failure {
                wf.failures.push(failure.clone());
            }
        }
        Ok(wf)
    }

    /// Workflow ids newest first, optionally filtered by status.
    fn ordered_ids(&self, status: Option<WorkflowStatus>) -> Result<Vec<String>, OrchestratorError> {
        let order = self.order.read().map_err(poisoned)?.clone();
        let mut ids = Vec::new();
        for id in order.into_iter().rev() {
            if let Some(wanted) = status {
                let entry = self.entry(&id)?;
                let current = entry.header.lock().map_err(poisoned)?.status;
                if current != wanted {
                    continue;
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, proposal: &Proposal, workflow: &Workflow) -> Result<(), OrchestratorError> {
        let mut workflows = self.workflows.write().map_err(poisoned)?;
        if workflows.contains_key(&workflow.id) {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        self.proposals
            .write()
            .map_err(poisoned)?
            .entry(proposal.id.clone())
            .or_insert_with(|| proposal.clone());

        let tasks = workflow
            .plan
            .iter()
            .map(|task| {
                Mutex::new(TaskRow {
                    task: task.clone(),
                    result: None,
                    failure: None,
                })
            })
            .collect();
        let entry = Entry {
            header: Mutex::new(workflow.clone()),
            tasks,
        };
        workflows.insert(workflow.id.clone(), Arc::new(entry));
        drop(workflows);
        self.order.write().map_err(poisoned)?.push(workflow.id.clone());
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        let entry = self.entry(workflow_id)?;
        Self::snapshot(&entry)
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, OrchestratorError> {
        let proposals = self.proposals.read().map_err(poisoned)?;
        proposals
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("proposal {}", proposal_id)))
    }

    async fn mark_running(&self, workflow_id: &str) -> Result<bool, OrchestratorError> {
        let entry = self.entry(workflow_id)?;
        let mut header = entry.header.lock().map_err(poisoned)?;
        if header.status != WorkflowStatus::Pending {
            return Ok(false);
        }
        header.status = WorkflowStatus::Running;
        header.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<AgentTask, OrchestratorError> {
        let entry = self.entry(workflow_id)?;
        let mut found = None;
        for slot in &entry.tasks {
            if slot.lock().map_err(poisoned)?.task.id == task_id {
                found = Some(slot);
                break;
            }
        }
        let slot = found.ok_or_else(|| {
            OrchestratorError::NotFound(format!("task {} in workflow {}", task_id, workflow_id))
        })?;

        let now = Utc::now();
        let task = {
            let mut row = slot.lock().map_err(poisoned)?;
            apply_update(&mut row.task, &update, now)?;
            match update {
                TaskUpdate::Succeeded(result) => row.result = Some(result),
                TaskUpdate::Failed(failure) => row.failure = Some(failure),
                TaskUpdate::Running { .. } | TaskUpdate::Skipped { .. } => {}
            }
            row.task.clone()
        };

        // Taken after the row lock is released; finalize locks header then rows.
        entry.header.lock().map_err(poisoned)?.updated_at = now;
        Ok(task)
    }

    async fn finalize(
        &self,
        workflow_id: &str,
        outcome: &WorkflowOutcome,
    ) -> Result<bool, OrchestratorError> {
        ensure_terminal_outcome(outcome)?;
        let entry = self.entry(workflow_id)?;
        let mut header = entry.header.lock().map_err(poisoned)?;
        if header.status.is_terminal() {
            return Ok(false);
        }
        let mut unfinished = 0;
        for slot in &entry.tasks {
            if !slot.lock().map_err(poisoned)?.task.status.is_terminal() {
                unfinished += 1;
            }
        }
        if unfinished > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} still has {} unfinished tasks",
                workflow_id, unfinished
            )));
        }
        let now = Utc::now();
        header.status = outcome.status;
        header.recommendation = outcome.recommendation.clone();
        header.diagnostics = outcome.diagnostics.clone();
        header.updated_at = now;
        header.completed_at = Some(now);
        Ok(true)
    }

    async fn append_feedback(
        &self,
        workflow_id: &str,
        feedback: HumanFeedback,
    ) -> Result<HumanFeedback, OrchestratorError> {
        let entry = self.entry(workflow_id)?;
        if let Some(task_id) = &feedback.task_id {
            let mut known = false;
            for slot in &entry.tasks {
                if slot.lock().map_err(poisoned)?.task.id == *task_id {
                    known = true;
                    break;
                }
            }
            if !known {
                return Err(OrchestratorError::NotFound(format!(
                    "task {} in workflow {}",
                    task_id, workflow_id
                )));
            }
        }
        let mut header = entry.header.lock().map_err(poisoned)?;
        let stored = HumanFeedback {
            seq: header.feedback.len() as u64 + 1,
            workflow_id: workflow_id.to_string(),
            ..feedback
        };
        header.feedback.push(stored.clone());
        header.updated_at = Utc::now();
        Ok(stored)
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, OrchestratorError> {
        let mut workflows = Vec::new();
        for id in self.ordered_ids(Some(status))? {
            let entry = self.entry(&id)?;
            workflows.push(Self::snapshot(&entry)?);
        }
        Ok(workflows)
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowSummary>, usize), OrchestratorError> {
        let ids = self.ordered_ids(status)?;
        let total = ids.len();
        let mut page = Vec::new();
        for id in ids.iter().skip(offset).take(limit) {
            let entry = self.entry(id)?;
            page.push(Self::snapshot(&entry)?.summary());
        }
        Ok((page, total))
    }
}
