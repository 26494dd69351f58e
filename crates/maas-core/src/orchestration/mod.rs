//! OrchestrationManager - the request/response surface over the core.
//!
//! Ties the planner, the execution engine and the store together:
//!   1. `submit` plans a proposal and starts the run without waiting for it
//!   2. `status` / `workflow` / `result` read what the store holds
//!   3. `submit_feedback` appends audit notes without touching task state
//!   4. `cancel` stops a run owned by this manager's engine

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::agent::AgentSet;
use crate::config::MaasConfig;
use crate::db::Database;
use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkflowEvent};
use crate::models::{
    FeedbackInput, HumanFeedback, Proposal, Workflow, WorkflowReport, WorkflowStatus,
    WorkflowSummary,
};
use crate::store::{SqliteWorkflowStore, WorkflowStore};
use crate::workflow::{ExecutionEngine, WorkflowPlanner};

pub struct OrchestrationManager {
    store: Arc<dyn WorkflowStore>,
    planner: WorkflowPlanner,
    engine: ExecutionEngine,
}

impl OrchestrationManager {
    pub fn new(store: Arc<dyn WorkflowStore>, agents: AgentSet, config: &MaasConfig) -> Self {
        let planner = WorkflowPlanner::new(store.clone(), config.planner.clone());
        let engine = ExecutionEngine::new(
            store.clone(),
            agents,
            config.engine.clone(),
            EventBus::new(),
        );
        Self {
            store,
            planner,
            engine,
        }
    }

    /// SQLite store at `config.db_path` and HTTP agents from `config.agents`.
    pub fn from_config(config: &MaasConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let db = Database::open(&config.db_path)?;
        let store: Arc<dyn WorkflowStore> = Arc::new(SqliteWorkflowStore::new(db));
        let agents = AgentSet::from_config(&config.agents)?;
        Ok(Self::new(store, agents, config))
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Plan a proposal without persisting anything.
    pub fn preview(&self, proposal: &Proposal) -> Result<Workflow, OrchestratorError> {
        self.planner.preview(proposal)
    }

    /// Plan and start a workflow; returns its id as soon as it is running.
    pub async fn submit(&self, proposal: &Proposal) -> Result<String, OrchestratorError> {
        let workflow = self.planner.plan(proposal).await?;
        let handle = self.engine.run(&workflow.id).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            proposal_id = %proposal.id,
            "[Manager] workflow submitted"
        );
        Ok(handle.workflow_id().to_string())
    }

    /// Plan a workflow and wait for it to reach a terminal state.
    pub async fn evaluate(&self, proposal: &Proposal) -> Result<Workflow, OrchestratorError> {
        let workflow = self.planner.plan(proposal).await?;
        self.engine.run_to_completion(&workflow.id).await
    }

    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSummary, OrchestratorError> {
        Ok(self.store.get(workflow_id).await?.summary())
    }

    /// The full workflow, including any partial results.
    pub async fn workflow(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        self.store.get(workflow_id).await
    }

    /// The final report. Not available until the workflow is terminal.
    pub async fn result(&self, workflow_id: &str) -> Result<WorkflowReport, OrchestratorError> {
        let workflow = self.store.get(workflow_id).await?;
        if !workflow.status.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is still {}",
                workflow_id, workflow.status
            )));
        }
        Ok(workflow.report())
    }

    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowSummary>, usize), OrchestratorError> {
        self.store.list(status, limit, offset).await
    }

    pub async fn submit_feedback(
        &self,
        workflow_id: &str,
        input: FeedbackInput,
    ) -> Result<HumanFeedback, OrchestratorError> {
        let feedback = HumanFeedback::from_input(workflow_id, input)?;
        let stored = self.store.append_feedback(workflow_id, feedback).await?;
        tracing::info!(
            workflow_id,
            seq = stored.seq,
            task_id = stored.task_id.as_deref().unwrap_or("-"),
            "[Manager] feedback recorded"
        );
        Ok(stored)
    }

    pub async fn cancel(&self, workflow_id: &str) -> Result<(), OrchestratorError> {
        self.engine.cancel(workflow_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.engine.events().subscribe()
    }
}
