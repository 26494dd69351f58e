//! `maas evaluate` / `maas plan` — run or preview a proposal workflow.

use maas_core::config::MaasConfig;
use maas_core::models::AgentKind;
use maas_core::OrchestrationManager;
use serde_json::json;

use super::{load_proposal, to_json};

/// Plan the proposal, run it to a terminal state and return the report.
pub async fn evaluate(
    manager: &OrchestrationManager,
    config: &MaasConfig,
    proposal_file: &str,
) -> Result<serde_json::Value, String> {
    let missing_keys: Vec<&str> = AgentKind::ALL
        .iter()
        .filter(|kind| config.agents.get(**kind).api_key.trim().is_empty())
        .map(|kind| kind.slug())
        .collect();
    if !missing_keys.is_empty() {
        return Err(format!(
            "No API key configured for agent(s): {}. Set agents.<kind>.api_key in the config file",
            missing_keys.join(", ")
        ));
    }

    let proposal = load_proposal(proposal_file)?;
    tracing::info!(proposal_id = %proposal.id, "[CLI] evaluating proposal");
    let workflow = manager.evaluate(&proposal).await.map_err(|e| e.to_string())?;
    to_json(&workflow.report())
}

/// Dry run: show which agents would run and in what order. Nothing is stored.
pub async fn plan(manager: &OrchestrationManager, proposal_file: &str) -> Result<serde_json::Value, String> {
    let proposal = load_proposal(proposal_file)?;
    let workflow = manager.preview(&proposal).map_err(|e| e.to_string())?;

    let tasks: Vec<serde_json::Value> = workflow
        .plan
        .iter()
        .map(|task| {
            json!({
                "agent": task.kind,
                "dependsOn": task
                    .dependencies
                    .iter()
                    .filter_map(|dep| workflow.task(dep).map(|t| t.kind))
                    .collect::<Vec<_>>(),
                "policy": task.policy,
            })
        })
        .collect();

    Ok(json!({
        "proposalId": proposal.id,
        "workflowType": workflow.workflow_type,
        "agents": workflow.plan.iter().map(|t| t.kind).collect::<Vec<_>>(),
        "tasks": tasks,
    }))
}
