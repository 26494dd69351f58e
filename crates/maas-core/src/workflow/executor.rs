//! Execution Engine — runs a planned workflow to a terminal state.
//!
//! One driver task per workflow owns dispatch decisions. Ready tasks are
//! spawned onto a `JoinSet`, one future per task, and each agent attempt
//! first takes a permit from the engine-wide semaphore. Every task future
//! writes its own transitions (`Running`, then `Succeeded` or `Failed`)
//! straight to the store, so sibling completions never wait on each other.
//!
//! ```text
//!            ┌──────── ready set ────────┐
//! store ──► driver ──► JoinSet ──► [permit] ──► Agent::invoke (timeout, retry)
//!   ▲          │  skip propagation              │
//!   └──────────┴──── task transitions ◄─────────┘
//!              │
//!              └──► aggregate ──► finalize (exactly once)
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::aggregator::aggregate;
use super::retry::RetryPolicy;
use crate::agent::{AgentInvocationError, AgentRequest, AgentSet};
use crate::config::EngineConfig;
use crate::error::OrchestratorError;
use crate::events::{EventBus, WorkflowEvent};
use crate::models::{
    AgentFailure, AgentResult, AgentTask, FailureKind, Proposal, Readiness, TaskStatus, Workflow,
};
use crate::store::{TaskUpdate, WorkflowStore};

/// Runs workflows. Cheap to clone; clones share the semaphore and the
/// registry of running workflows.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn WorkflowStore>,
    agents: AgentSet,
    config: EngineConfig,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    events: EventBus,
    running: Mutex<HashMap<String, CancellationToken>>,
}

/// Handle to a workflow run started with [`ExecutionEngine::run`].
pub struct RunHandle {
    workflow_id: String,
    handle: JoinHandle<Result<Workflow, OrchestratorError>>,
}

impl RunHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Block until the workflow is terminal and return its final state.
    pub async fn wait(self) -> Result<Workflow, OrchestratorError> {
        self.handle
            .await
            .map_err(|e| OrchestratorError::Internal(format!("workflow driver failed: {}", e)))?
    }
}

/// How a dispatched task ended, as seen by the driver.
struct TaskOutcome {
    task_id: String,
    status: TaskStatus,
    result: Option<AgentResult>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        agents: AgentSet,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_agent_calls.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                store,
                agents,
                config,
                retry,
                permits,
                events,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start executing a Pending workflow and return immediately.
    ///
    /// Fails with `Conflict` if the workflow has already been started.
    pub async fn run(&self, workflow_id: &str) -> Result<RunHandle, OrchestratorError> {
        if !self.inner.store.mark_running(workflow_id).await? {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is not pending",
                workflow_id
            )));
        }

        let token = CancellationToken::new();
        self.inner
            .running
            .lock()
            .map_err(|e| OrchestratorError::Internal(format!("Lock poisoned: {}", e)))?
            .insert(workflow_id.to_string(), token.clone());

        let inner = self.inner.clone();
        let id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            let result = drive(inner.clone(), id.clone(), token).await;
            inner.unregister(&id);
            if let Err(e) = &result {
                tracing::error!(workflow_id = %id, error = %e, "[Engine] workflow driver stopped");
            }
            result
        });

        Ok(RunHandle {
            workflow_id: workflow_id.to_string(),
            handle,
        })
    }

    /// Run a Pending workflow and wait for its terminal state.
    pub async fn run_to_completion(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        self.run(workflow_id).await?.wait().await
    }

    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.inner
            .running
            .lock()
            .map(|running| running.contains_key(workflow_id))
            .unwrap_or(false)
    }

    /// Request cancellation. Dispatch stops at once; in-flight calls are
    /// dropped and unfinished tasks are recorded as cancelled failures.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), OrchestratorError> {
        let token = self
            .inner
            .running
            .lock()
            .map_err(|e| OrchestratorError::Internal(format!("Lock poisoned: {}", e)))?
            .get(workflow_id)
            .cloned();
        match token {
            Some(token) => {
                tracing::info!(workflow_id, "[Engine] cancellation requested");
                token.cancel();
                Ok(())
            }
            None => {
                let workflow = self.inner.store.get(workflow_id).await?;
                Err(OrchestratorError::Conflict(format!(
                    "workflow {} is {} and not running in this engine",
                    workflow_id, workflow.status
                )))
            }
        }
    }
}

impl EngineInner {
    fn unregister(&self, workflow_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(workflow_id);
        }
    }
}

async fn drive(
    inner: Arc<EngineInner>,
    workflow_id: String,
    cancel: CancellationToken,
) -> Result<Workflow, OrchestratorError> {
    let mut in_flight: JoinSet<Result<TaskOutcome, OrchestratorError>> = JoinSet::new();

    let halted = match dispatch(&inner, &workflow_id, &cancel, &mut in_flight).await {
        Ok(None) => None,
        Ok(Some(FailureKind::Cancelled)) => Some((FailureKind::Cancelled, "workflow cancelled".to_string())),
        Ok(Some(kind)) => Some((
            kind,
            format!(
                "workflow exceeded its {}s time budget",
                inner.config.workflow_timeout_secs
            ),
        )),
        // A store or join error must still leave the workflow terminal.
        Err(e) => {
            tracing::error!(workflow_id = %workflow_id, error = %e, "[Engine] driver error, failing unfinished tasks");
            Some((FailureKind::Internal, format!("workflow driver error: {}", e)))
        }
    };

    if let Some((kind, message)) = halted {
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
        force_fail(&inner, &workflow_id, kind, &message).await?;
    }
    // Nothing is left to cancel once every task is terminal.
    inner.unregister(&workflow_id);

    let workflow = inner.store.get(&workflow_id).await?;
    let outcome = aggregate(&workflow)?;
    if inner.store.finalize(&workflow_id, &outcome).await? {
        tracing::info!(
            workflow_id = %workflow_id,
            status = outcome.status.as_str(),
            failed_tasks = outcome.diagnostics.len(),
            "[Engine] workflow finished"
        );
        inner.events.emit(WorkflowEvent::WorkflowFinished {
            workflow_id: workflow_id.clone(),
            status: outcome.status,
            finished_at: Utc::now(),
        });
    }
    inner.store.get(&workflow_id).await
}

/// Dispatch until every task is terminal, or until cancellation or the
/// workflow deadline halts the run.
async fn dispatch(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    cancel: &CancellationToken,
    in_flight: &mut JoinSet<Result<TaskOutcome, OrchestratorError>>,
) -> Result<Option<FailureKind>, OrchestratorError> {
    let workflow = inner.store.get(workflow_id).await?;
    let proposal = Arc::new(inner.store.get_proposal(&workflow.proposal_id).await?);
    let tasks = workflow.plan.clone();

    inner.events.emit(WorkflowEvent::WorkflowStarted {
        workflow_id: workflow_id.to_string(),
        task_count: tasks.len(),
    });
    tracing::info!(workflow_id, tasks = tasks.len(), "[Engine] workflow started");

    let mut statuses: HashMap<String, TaskStatus> =
        tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
    let mut results: HashMap<String, AgentResult> = workflow
        .results
        .iter()
        .map(|r| (r.task_id.clone(), r.clone()))
        .collect();

    let deadline = tokio::time::sleep_until(Instant::now() + inner.config.workflow_timeout());
    tokio::pin!(deadline);

    loop {
        if cancel.is_cancelled() {
            return Ok(Some(FailureKind::Cancelled));
        }
        if deadline.is_elapsed() {
            return Ok(Some(FailureKind::WorkflowTimeout));
        }

        schedule(inner, workflow_id, &proposal, &tasks, &mut statuses, &results, in_flight).await?;
        if in_flight.is_empty() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Some(FailureKind::Cancelled)),
            _ = &mut deadline => return Ok(Some(FailureKind::WorkflowTimeout)),
            Some(joined) = in_flight.join_next() => {
                let outcome = joined.map_err(|e| {
                    OrchestratorError::Internal(format!("task future failed: {}", e))
                })??;
                statuses.insert(outcome.task_id.clone(), outcome.status);
                if let Some(result) = outcome.result {
                    results.insert(outcome.task_id, result);
                }
            }
        }
    }
}

/// Skip blocked tasks and dispatch ready ones until nothing changes.
async fn schedule(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    proposal: &Arc<Proposal>,
    tasks: &[AgentTask],
    statuses: &mut HashMap<String, TaskStatus>,
    results: &HashMap<String, AgentResult>,
    in_flight: &mut JoinSet<Result<TaskOutcome, OrchestratorError>>,
) -> Result<(), OrchestratorError> {
    loop {
        let mut changed = false;
        for task in tasks {
            if statuses.get(&task.id) != Some(&TaskStatus::Pending) {
                continue;
            }
            match task.readiness(|id| statuses.get(id).copied()) {
                Readiness::Waiting => {}
                Readiness::Blocked(reason) => {
                    inner
                        .store
                        .update_task(workflow_id, &task.id, TaskUpdate::Skipped { reason: reason.clone() })
                        .await?;
                    tracing::info!(workflow_id, task_id = %task.id, agent = %task.kind, %reason, "[Engine] task skipped");
                    inner.events.emit(WorkflowEvent::TaskSkipped {
                        workflow_id: workflow_id.to_string(),
                        task_id: task.id.clone(),
                        agent: task.kind,
                        reason,
                    });
                    statuses.insert(task.id.clone(), TaskStatus::Skipped);
                    changed = true;
                }
                Readiness::Ready => {
                    // Dependencies are listed in plan order.
                    let dependency_results: Vec<AgentResult> = task
                        .dependencies
                        .iter()
                        .filter_map(|dep| results.get(dep).cloned())
                        .collect();
                    in_flight.spawn(run_task(
                        inner.clone(),
                        task.clone(),
                        proposal.clone(),
                        dependency_results,
                    ));
                    statuses.insert(task.id.clone(), TaskStatus::Running);
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(());
        }
    }
}

/// Run one task through its attempts and record the terminal transition.
async fn run_task(
    inner: Arc<EngineInner>,
    task: AgentTask,
    proposal: Arc<Proposal>,
    dependency_results: Vec<AgentResult>,
) -> Result<TaskOutcome, OrchestratorError> {
    let agent = inner.agents.get(task.kind);
    let inputs: Vec<String> = dependency_results.iter().map(|r| r.task_id.clone()).collect();
    let max_attempts = inner.retry.max_attempts();
    let timeout = inner.config.task_timeout();
    let mut attempt = 0;

    let failure = loop {
        attempt += 1;
        let permit = inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("agent semaphore closed: {}", e)))?;

        inner
            .store
            .update_task(&task.workflow_id, &task.id, TaskUpdate::Running { attempt })
            .await?;
        inner.events.emit(WorkflowEvent::TaskStarted {
            workflow_id: task.workflow_id.clone(),
            task_id: task.id.clone(),
            agent: task.kind,
            attempt,
        });
        tracing::debug!(workflow_id = %task.workflow_id, task_id = %task.id, agent = %task.kind, attempt, "[Engine] invoking agent");

        let request = AgentRequest {
            workflow_id: task.workflow_id.clone(),
            task_id: task.id.clone(),
            kind: task.kind,
            attempt,
            proposal: proposal.clone(),
            dependency_results: dependency_results.clone(),
        };
        let call = AssertUnwindSafe(agent.invoke(&request)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, call).await;
        drop(permit);

        let error = match outcome {
            Ok(Ok(Ok(output))) => {
                let result = AgentResult {
                    task_id: task.id.clone(),
                    agent: task.kind,
                    findings: output.findings,
                    score: output.score,
                    summary: output.summary,
                    inputs: inputs.clone(),
                    created_at: Utc::now(),
                };
                inner
                    .store
                    .update_task(&task.workflow_id, &task.id, TaskUpdate::Succeeded(result.clone()))
                    .await?;
                tracing::info!(workflow_id = %task.workflow_id, task_id = %task.id, agent = %task.kind, attempt, "[Engine] task succeeded");
                inner.events.emit(WorkflowEvent::TaskSucceeded {
                    workflow_id: task.workflow_id.clone(),
                    task_id: task.id.clone(),
                    agent: task.kind,
                    attempts: attempt,
                });
                return Ok(TaskOutcome {
                    task_id: task.id,
                    status: TaskStatus::Succeeded,
                    result: Some(result),
                });
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_panic)) => {
                break AgentFailure::new(&task, FailureKind::Internal, "agent panicked", attempt);
            }
            Err(_elapsed) => AgentInvocationError::Timeout(timeout),
        };

        if !error.is_retryable() || attempt >= max_attempts {
            break AgentFailure::new(&task, error.kind(), error.to_string(), attempt);
        }

        let delay = inner.retry.compute_delay(attempt - 1);
        tracing::warn!(
            workflow_id = %task.workflow_id,
            task_id = %task.id,
            agent = %task.kind,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "[Engine] retrying agent call"
        );
        inner.events.emit(WorkflowEvent::TaskRetrying {
            workflow_id: task.workflow_id.clone(),
            task_id: task.id.clone(),
            agent: task.kind,
            attempt,
            kind: error.kind(),
            delay_ms: delay.as_millis() as u64,
        });
        tokio::time::sleep(delay).await;
    };

    inner
        .store
        .update_task(&task.workflow_id, &task.id, TaskUpdate::Failed(failure.clone()))
        .await?;
    tracing::warn!(
        workflow_id = %task.workflow_id,
        task_id = %task.id,
        agent = %task.kind,
        attempts = failure.attempts,
        kind = failure.kind.as_str(),
        message = %failure.message,
        "[Engine] task failed"
    );
    inner.events.emit(WorkflowEvent::TaskFailed {
        workflow_id: task.workflow_id.clone(),
        task_id: task.id.clone(),
        agent: task.kind,
        kind: failure.kind,
        message: failure.message,
    });
    Ok(TaskOutcome {
        task_id: task.id,
        status: TaskStatus::Failed,
        result: None,
    })
}

/// Mark every unfinished task Failed after a halt.
///
/// Keeps going past a failed write so one bad row does not leave its
/// siblings unfinished; the first error is returned at the end.
async fn force_fail(
    inner: &Arc<EngineInner>,
    workflow_id: &str,
    kind: FailureKind,
    message: &str,
) -> Result<(), OrchestratorError> {
    tracing::warn!(workflow_id, kind = kind.as_str(), reason = message, "[Engine] halting workflow");

    let workflow = inner.store.get(workflow_id).await?;
    let mut first_error = None;
    for task in workflow.plan.iter().filter(|t| !t.status.is_terminal()) {
        let failure = AgentFailure::new(task, kind, message, task.attempts);
        match inner
            .store
            .update_task(workflow_id, &task.id, TaskUpdate::Failed(failure))
            .await
        {
            Ok(_) => inner.events.emit(WorkflowEvent::TaskFailed {
                workflow_id: workflow_id.to_string(),
                task_id: task.id.clone(),
                agent: task.kind,
                kind,
                message: message.to_string(),
            }),
            // An aborted attempt finished its own write first.
            Err(OrchestratorError::Conflict(_)) => {}
            Err(e) => {
                tracing::error!(workflow_id, task_id = %task.id, error = %e, "[Engine] could not fail task");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
