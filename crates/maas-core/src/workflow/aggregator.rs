//! Result Aggregator — folds a terminal plan into the workflow outcome.
//!
//! Pure function of the stored tasks, results and failures. Ordering follows
//! the plan and `BTreeMap` keys, and the synthesis timestamp is taken from
//! the orchestrator's stored result, so the same workflow always aggregates
//! to an identical value.

use std::collections::BTreeMap;

use crate::error::OrchestratorError;
use crate::models::{
    AgentKind, FailureKind, FinalRecommendation, TaskDiagnostic, TaskStatus, Workflow,
    WorkflowOutcome, WorkflowStatus,
};

const NO_RECOMMENDATION: &str = "No recommendation available";

pub fn aggregate(workflow: &Workflow) -> Result<WorkflowOutcome, OrchestratorError> {
    if let Some(task) = workflow.plan.iter().find(|t| !t.status.is_terminal()) {
        return Err(OrchestratorError::Conflict(format!(
            "cannot aggregate workflow {}: task {} is {}",
            workflow.id,
            task.id,
            task.status.as_str()
        )));
    }

    let diagnostics = diagnose(workflow);
    let orchestrator = workflow
        .task_by_kind(AgentKind::Orchestrator)
        .ok_or_else(|| {
            OrchestratorError::Internal(format!("workflow {} has no orchestrator task", workflow.id))
        })?;

    let cancelled = workflow
        .failures
        .iter()
        .any(|f| f.kind == FailureKind::Cancelled);
    if cancelled {
        return Ok(WorkflowOutcome {
            status: WorkflowStatus::Cancelled,
            recommendation: None,
            diagnostics,
        });
    }

    let synthesis = match (orchestrator.status, workflow.result_for(&orchestrator.id)) {
        (TaskStatus::Succeeded, Some(result)) => result,
        _ => {
            return Ok(WorkflowOutcome {
                status: WorkflowStatus::Failed,
                recommendation: None,
                diagnostics,
            })
        }
    };

    let mut inputs = Vec::new();
    let mut findings = BTreeMap::new();
    for task in &workflow.plan {
        if !synthesis.inputs.contains(&task.id) {
            continue;
        }
        if let Some(result) = workflow.result_for(&task.id) {
            inputs.push(task.kind);
            findings.insert(task.kind, result.findings.clone());
        }
    }

    let recommendation = synthesis
        .summary
        .clone()
        .or_else(|| text_field(&synthesis.findings, "overall_recommendation"))
        .or_else(|| text_field(&synthesis.findings, "recommendation"))
        .unwrap_or_else(|| NO_RECOMMENDATION.to_string());

    let missing = diagnostics
        .iter()
        .filter(|d| d.agent.is_specialist())
        .cloned()
        .collect();

    let status = if workflow.plan.iter().all(|t| t.status == TaskStatus::Succeeded) {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::PartiallyFailed
    };

    Ok(WorkflowOutcome {
        status,
        recommendation: Some(FinalRecommendation {
            workflow_id: workflow.id.clone(),
            recommendation,
            score: synthesis.score,
            synthesis: synthesis.findings.clone(),
            inputs,
            findings,
            missing,
            synthesized_at: synthesis.created_at,
        }),
        diagnostics,
    })
}

/// One entry per task that did not succeed, in plan order.
fn diagnose(workflow: &Workflow) -> Vec<TaskDiagnostic> {
    workflow
        .plan
        .iter()
        .filter(|t| t.status != TaskStatus::Succeeded)
        .map(|task| {
            let failure = workflow.failure_for(&task.id);
            let reason = match (failure, &task.skip_reason) {
                (Some(f), _) => f.message.clone(),
                (None, Some(reason)) => reason.clone(),
                (None, None) => "no result recorded".to_string(),
            };
            TaskDiagnostic {
                task_id: task.id.clone(),
                agent: task.kind,
                status: task.status,
                failure_kind: failure.map(|f| f.kind),
                reason,
            }
        })
        .collect()
}

fn text_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}
