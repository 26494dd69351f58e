//! End-to-end workflow runs against scripted agents and the in-memory store.
//!
//! Time is paused, so agent delays, per-attempt timeouts and backoff all run
//! on tokio's virtual clock.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use common::*;
use maas_core::models::{
    AgentKind, AgentTask, FailureKind, FeedbackInput, HumanFeedback, Proposal, TaskStatus, Workflow,
    WorkflowOutcome, WorkflowStatus, WorkflowSummary,
};
use maas_core::store::TaskUpdate;
use maas_core::workflow::aggregate;
use maas_core::{InMemoryWorkflowStore, OrchestratorError, WorkflowEvent, WorkflowStore};

fn store() -> Arc<dyn WorkflowStore> {
    Arc::new(InMemoryWorkflowStore::new())
}

/// Wait for the `WorkflowFinished` event of one workflow.
async fn finished(rx: &mut broadcast::Receiver<WorkflowEvent>, workflow_id: &str) -> WorkflowStatus {
    loop {
        match rx.recv().await.expect("event stream closed") {
            WorkflowEvent::WorkflowFinished {
                workflow_id: id,
                status,
                ..
            } if id == workflow_id => return status,
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_independent_agents_run_in_parallel() {
    let agents = Agents::new();
    agents.compliance.set_delay(Duration::from_millis(100));
    agents.evaluation.set_delay(Duration::from_millis(200));
    agents.market.set_delay(Duration::from_millis(300));
    agents.orchestrator.set_delay(Duration::from_millis(50));
    let manager = manager(store(), &agents, fast_engine());

    let started = Instant::now();
    let workflow = manager.evaluate(&proposal("p-parallel")).await.expect("evaluate");
    let elapsed = started.elapsed();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    // Sequential execution would take 650ms.
    assert!(elapsed >= Duration::from_millis(350), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "elapsed {:?}", elapsed);
    assert_eq!(agents.gauge.peak(), 3);

    let expected: Vec<String> = ["compliance", "evaluation", "market"]
        .iter()
        .map(|slug| format!("{}-{}", workflow.id, slug))
        .collect();
    assert_eq!(agents.orchestrator.seen_inputs(), vec![expected]);
}

#[tokio::test(start_paused = true)]
async fn test_market_timeout_yields_partial_recommendation() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Hang);
    let manager = manager(store(), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-partial")).await.expect("evaluate");

    assert_eq!(workflow.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(agents.market.calls(), 3);

    let market = workflow.task_by_kind(AgentKind::Market).expect("market task");
    assert_eq!(market.status, TaskStatus::Failed);
    assert_eq!(market.attempts, 3);
    let failure = workflow.failure_for(&market.id).expect("market failure");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.retryable);

    let rec = workflow.recommendation.as_ref().expect("recommendation");
    assert_eq!(rec.inputs, vec![AgentKind::Compliance, AgentKind::Evaluation]);
    assert!(!rec.findings.contains_key(&AgentKind::Market));
    assert_eq!(rec.missing.len(), 1);
    assert_eq!(rec.missing[0].agent, AgentKind::Market);
    assert_eq!(agents.orchestrator.seen_inputs()[0].len(), 2);

    let orchestrator = workflow
        .task_by_kind(AgentKind::Orchestrator)
        .expect("orchestrator task");
    let synthesis = workflow.result_for(&orchestrator.id).expect("synthesis");
    assert_eq!(synthesis.inputs.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_all_specialists_failing_skips_orchestrator() {
    let agents = Agents::new();
    for kind in AgentKind::SPECIALISTS {
        agents.get(kind).otherwise(Behavior::Fail(rejected_error));
    }
    let manager = manager(store(), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-doomed")).await.expect("evaluate");

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.recommendation.is_none());
    assert_eq!(agents.orchestrator.calls(), 0);

    let orchestrator = workflow
        .task_by_kind(AgentKind::Orchestrator)
        .expect("orchestrator task");
    assert_eq!(orchestrator.status, TaskStatus::Skipped);
    assert!(orchestrator.skip_reason.is_some());
    assert_eq!(workflow.diagnostics.len(), 4);
    for kind in AgentKind::SPECIALISTS {
        assert_eq!(agents.get(kind).calls(), 1, "{} should not retry", kind);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success() {
    let agents = Agents::new();
    agents.evaluation.then(Behavior::Fail(quota_error));
    agents.evaluation.then(Behavior::Fail(malformed_error));
    let manager = manager(store(), &agents, fast_engine());
    let mut events = manager.subscribe();

    let workflow = manager.evaluate(&proposal("p-retry")).await.expect("evaluate");

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(agents.evaluation.calls(), 3);
    let evaluation = workflow.task_by_kind(AgentKind::Evaluation).expect("task");
    assert_eq!(evaluation.attempts, 3);
    assert!(workflow.failures.is_empty());

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::TaskRetrying { agent, kind, delay_ms, .. } = event {
            retries.push((agent, kind, delay_ms));
        }
    }
    assert_eq!(
        retries,
        vec![
            (AgentKind::Evaluation, FailureKind::Quota, 20),
            (AgentKind::Evaluation, FailureKind::MalformedOutput, 40),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_is_not_retried() {
    let agents = Agents::new();
    agents.compliance.otherwise(Behavior::Fail(rejected_error));
    let manager = manager(store(), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-rejected")).await.expect("evaluate");

    assert_eq!(workflow.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(agents.compliance.calls(), 1);
    let compliance = workflow.task_by_kind(AgentKind::Compliance).expect("task");
    let failure = workflow.failure_for(&compliance.id).expect("failure");
    assert_eq!(failure.kind, FailureKind::Rejected);
    assert!(!failure.retryable);
    assert_eq!(failure.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_agent_is_recorded_as_internal_failure() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Panic);
    let manager = manager(store(), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-panic")).await.expect("evaluate");

    assert_eq!(workflow.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(agents.market.calls(), 1);
    let market = workflow.task_by_kind(AgentKind::Market).expect("task");
    let failure = workflow.failure_for(&market.id).expect("failure");
    assert_eq!(failure.kind, FailureKind::Internal);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_timeout_fails_unfinished_tasks() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Hang);
    let mut engine = fast_engine();
    engine.task_timeout_secs = 60;
    engine.workflow_timeout_secs = 2;
    let manager = manager(store(), &agents, engine);

    let started = Instant::now();
    let workflow = manager.evaluate(&proposal("p-slow")).await.expect("evaluate");
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    for kind in [AgentKind::Compliance, AgentKind::Evaluation] {
        assert_eq!(workflow.task_by_kind(kind).expect("task").status, TaskStatus::Succeeded);
    }
    for kind in [AgentKind::Market, AgentKind::Orchestrator] {
        let task = workflow.task_by_kind(kind).expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        let failure = workflow.failure_for(&task.id).expect("failure");
        assert_eq!(failure.kind, FailureKind::WorkflowTimeout);
    }
    assert_eq!(agents.orchestrator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_shows_partial_results_while_running() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Hang);
    let mut engine = fast_engine();
    engine.task_timeout_secs = 60;
    let manager = manager(store(), &agents, engine);
    let mut events = manager.subscribe();

    let workflow_id = manager.submit(&proposal("p-poll")).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let workflow = manager.workflow(&workflow_id).await.expect("workflow");
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert_eq!(workflow.results.len(), 2);
    assert_eq!(
        workflow.task_by_kind(AgentKind::Market).expect("task").status,
        TaskStatus::Running
    );
    let summary = manager.status(&workflow_id).await.expect("status");
    assert_eq!(summary.task_counts.get("SUCCEEDED"), Some(&2));
    assert!(matches!(
        manager.result(&workflow_id).await,
        Err(OrchestratorError::Conflict(_))
    ));

    manager.cancel(&workflow_id).await.expect("cancel");
    assert_eq!(finished(&mut events, &workflow_id).await, WorkflowStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_a_running_workflow() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Hang);
    let mut engine = fast_engine();
    engine.task_timeout_secs = 60;
    let manager = manager(store(), &agents, engine);
    let mut events = manager.subscribe();

    let workflow_id = manager.submit(&proposal("p-cancel")).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel(&workflow_id).await.expect("cancel");
    assert_eq!(finished(&mut events, &workflow_id).await, WorkflowStatus::Cancelled);

    let workflow = manager.workflow(&workflow_id).await.expect("workflow");
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    assert!(workflow.recommendation.is_none());
    let market = workflow.task_by_kind(AgentKind::Market).expect("task");
    assert_eq!(
        workflow.failure_for(&market.id).map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(agents.orchestrator.calls(), 0);

    assert!(matches!(
        manager.cancel(&workflow_id).await,
        Err(OrchestratorError::Conflict(_))
    ));
    let report = manager.result(&workflow_id).await.expect("report");
    assert_eq!(report.status, WorkflowStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_is_respected() {
    let agents = Agents::new();
    for kind in AgentKind::ALL {
        agents.get(kind).set_delay(Duration::from_millis(100));
    }
    let mut engine = fast_engine();
    engine.max_concurrent_agent_calls = 2;
    let manager = manager(store(), &agents, engine);

    let mut events = manager.subscribe();
    let first = manager.submit(&proposal("p-one")).await.expect("submit");
    let second = manager.submit(&proposal("p-two")).await.expect("submit");
    let mut remaining = vec![first.clone(), second.clone()];
    while !remaining.is_empty() {
        if let WorkflowEvent::WorkflowFinished { workflow_id, .. } =
            events.recv().await.expect("event")
        {
            remaining.retain(|id| *id != workflow_id);
        }
    }

    assert_eq!(agents.gauge.peak(), 2);
    for id in [first, second] {
        let summary = manager.status(&id).await.expect("status");
        assert_eq!(summary.status, WorkflowStatus::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_workflow_runs_only_once() {
    let agents = Agents::new();
    let manager = manager(store(), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-once")).await.expect("evaluate");
    let again = manager.engine().run(&workflow.id).await;
    assert!(matches!(again, Err(OrchestratorError::Conflict(_))));
    assert_eq!(agents.compliance.calls(), 1);

    let missing = manager.engine().run("no-such-workflow").await;
    assert!(matches!(missing, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_task_transitions() {
    let agents = Agents::new();
    let manager = manager(store(), &agents, fast_engine());
    let mut rx = manager.subscribe();

    let workflow = manager.evaluate(&proposal("p-events")).await.expect("evaluate");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(WorkflowEvent::WorkflowStarted { task_count: 4, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowFinished {
            status: WorkflowStatus::Completed,
            ..
        })
    ));
    for task in &workflow.plan {
        let started = events.iter().position(|e| {
            matches!(e, WorkflowEvent::TaskStarted { task_id, attempt: 1, .. } if *task_id == task.id)
        });
        let succeeded = events.iter().position(|e| {
            matches!(e, WorkflowEvent::TaskSucceeded { task_id, .. } if *task_id == task.id)
        });
        assert!(started.expect("started") < succeeded.expect("succeeded"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_feedback_keeps_terminal_status() {
    let agents = Agents::new();
    let manager = manager(store(), &agents, fast_engine());
    let workflow = manager.evaluate(&proposal("p-feedback")).await.expect("evaluate");

    for note in ["Pricing assumptions look optimistic", "Approved by committee"] {
        manager
            .submit_feedback(
                &workflow.id,
                FeedbackInput {
                    annotation: note.to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("feedback");
    }
    let unknown_task = manager
        .submit_feedback(
            &workflow.id,
            FeedbackInput {
                task_id: Some("not-a-task".to_string()),
                annotation: "hm".to_string(),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(unknown_task, Err(OrchestratorError::NotFound(_))));
    let bad_rating = manager
        .submit_feedback(
            &workflow.id,
            FeedbackInput {
                annotation: "great".to_string(),
                rating: Some(9),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(bad_rating, Err(OrchestratorError::BadRequest(_))));

    let after = manager.workflow(&workflow.id).await.expect("workflow");
    assert_eq!(after.status, WorkflowStatus::Completed);
    assert_eq!(after.plan, workflow.plan);
    assert_eq!(after.recommendation, workflow.recommendation);
    let seqs: Vec<u64> = after.feedback.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(agents.orchestrator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_aggregation_is_repeatable() {
    let agents = Agents::new();
    agents.market.otherwise(Behavior::Fail(rejected_error));
    let manager = manager(store(), &agents, fast_engine());
    let workflow = manager.evaluate(&proposal("p-agg")).await.expect("evaluate");

    let first = aggregate(&workflow).expect("aggregate");
    let second = aggregate(&workflow).expect("aggregate");
    assert_eq!(
        serde_json::to_string(&first).expect("json"),
        serde_json::to_string(&second).expect("json")
    );
    assert_eq!(first.status, workflow.status);
    assert_eq!(first.recommendation, workflow.recommendation);
}

#[tokio::test]
async fn test_unknown_workflow_is_not_found() {
    let agents = Agents::new();
    let manager = manager(store(), &agents, fast_engine());

    assert!(manager.status("ghost").await.unwrap_err().is_not_found());
    assert!(manager.workflow("ghost").await.unwrap_err().is_not_found());
    assert!(manager.result("ghost").await.unwrap_err().is_not_found());
    let feedback = manager
        .submit_feedback(
            "ghost",
            FeedbackInput {
                annotation: "anyone there?".to_string(),
                ..Default::default()
            },
        )
        .await;
    assert!(feedback.unwrap_err().is_not_found());
}

/// In-memory store that fails one chosen operation once with a database error.
struct FlakyStore {
    inner: InMemoryWorkflowStore,
    fail_success_of: Option<AgentKind>,
    fail_proposal: bool,
    tripped: AtomicBool,
}

impl FlakyStore {
    fn failing_success_of(kind: AgentKind) -> Self {
        Self {
            inner: InMemoryWorkflowStore::new(),
            fail_success_of: Some(kind),
            fail_proposal: false,
            tripped: AtomicBool::new(false),
        }
    }

    fn failing_proposal_read() -> Self {
        Self {
            inner: InMemoryWorkflowStore::new(),
            fail_success_of: None,
            fail_proposal: true,
            tripped: AtomicBool::new(false),
        }
    }

    fn trip(&self) -> Result<(), OrchestratorError> {
        if self.tripped.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestratorError::Database("disk I/O error".to_string()))
        }
    }
}

#[async_trait]
impl WorkflowStore for FlakyStore {
    async fn create(&self, proposal: &Proposal, workflow: &Workflow) -> Result<(), OrchestratorError> {
        self.inner.create(proposal, workflow).await
    }

    async fn get(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        self.inner.get(workflow_id).await
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, OrchestratorError> {
        if self.fail_proposal {
            self.trip()?;
        }
        self.inner.get_proposal(proposal_id).await
    }

    async fn mark_running(&self, workflow_id: &str) -> Result<bool, OrchestratorError> {
        self.inner.mark_running(workflow_id).await
    }

    async fn update_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<AgentTask, OrchestratorError> {
        if let (Some(kind), TaskUpdate::Succeeded(result)) = (self.fail_success_of, &update) {
            if result.agent == kind {
                self.trip()?;
            }
        }
        self.inner.update_task(workflow_id, task_id, update).await
    }

    async fn finalize(&self, workflow_id: &str, outcome: &WorkflowOutcome) -> Result<bool, OrchestratorError> {
        self.inner.finalize(workflow_id, outcome).await
    }

    async fn append_feedback(
        &self,
        workflow_id: &str,
        feedback: HumanFeedback,
    ) -> Result<HumanFeedback, OrchestratorError> {
        self.inner.append_feedback(workflow_id, feedback).await
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, OrchestratorError> {
        self.inner.list_by_status(status).await
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowSummary>, usize), OrchestratorError> {
        self.inner.list(status, limit, offset).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_error_mid_run_still_finishes_the_workflow() {
    let agents = Agents::new();
    agents.compliance.set_delay(Duration::from_millis(10));
    agents.evaluation.set_delay(Duration::from_millis(20));
    agents.market.set_delay(Duration::from_millis(50));
    let manager = manager(
        Arc::new(FlakyStore::failing_success_of(AgentKind::Market)),
        &agents,
        fast_engine(),
    );
    let mut events = manager.subscribe();

    let workflow = manager.evaluate(&proposal("p-flaky")).await.expect("evaluate");
    assert_eq!(finished(&mut events, &workflow.id).await, WorkflowStatus::Failed);
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.recommendation.is_none());
    assert!(workflow.all_tasks_terminal());

    for kind in [AgentKind::Compliance, AgentKind::Evaluation] {
        let task = workflow.task_by_kind(kind).expect("task");
        assert_eq!(task.status, TaskStatus::Succeeded);
    }
    let market = workflow.task_by_kind(AgentKind::Market).expect("task");
    assert_eq!(market.status, TaskStatus::Failed);
    let failure = workflow.failure_for(&market.id).expect("market failure");
    assert_eq!(failure.kind, FailureKind::Internal);
    assert!(failure.message.contains("disk I/O error"), "message: {}", failure.message);
    let orchestrator = workflow.task_by_kind(AgentKind::Orchestrator).expect("task");
    assert_eq!(orchestrator.status, TaskStatus::Failed);
    assert_eq!(agents.orchestrator.calls(), 0);

    assert!(!manager.engine().is_running(&workflow.id));
    assert!(matches!(
        manager.cancel(&workflow.id).await,
        Err(OrchestratorError::Conflict(_))
    ));
    let report = manager.result(&workflow.id).await.expect("report");
    assert_eq!(report.status, WorkflowStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_proposal_fails_every_task() {
    let agents = Agents::new();
    let manager = manager(Arc::new(FlakyStore::failing_proposal_read()), &agents, fast_engine());

    let workflow = manager.evaluate(&proposal("p-unreadable")).await.expect("evaluate");
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.failures.len(), workflow.plan.len());
    assert!(workflow
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::Internal));
    for kind in AgentKind::ALL {
        assert_eq!(agents.get(kind).calls(), 0);
    }
}
