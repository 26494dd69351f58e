//! `maas status|show|result|list` — workflow queries.

use maas_core::models::WorkflowStatus;
use maas_core::OrchestrationManager;
use serde::Serialize;

use super::to_json;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRow {
    id: String,
    status: WorkflowStatus,
    proposal_id: String,
    created: String,
    tasks: String,
}

pub async fn status(manager: &OrchestrationManager, workflow_id: &str) -> Result<serde_json::Value, String> {
    let summary = manager.status(workflow_id).await.map_err(|e| e.to_string())?;
    to_json(&summary)
}

/// Full workflow document, including partial results while it runs.
pub async fn show(manager: &OrchestrationManager, workflow_id: &str) -> Result<serde_json::Value, String> {
    let workflow = manager.workflow(workflow_id).await.map_err(|e| e.to_string())?;
    to_json(&workflow)
}

pub async fn result(manager: &OrchestrationManager, workflow_id: &str) -> Result<serde_json::Value, String> {
    let report = manager.result(workflow_id).await.map_err(|e| e.to_string())?;
    to_json(&report)
}

pub async fn list(
    manager: &OrchestrationManager,
    status: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<serde_json::Value, String> {
    let status = status
        .map(|s| {
            WorkflowStatus::from_str(s).ok_or_else(|| {
                format!(
                    "Unknown status '{}'. Expected one of: pending, running, partially_failed, completed, failed, cancelled",
                    s
                )
            })
        })
        .transpose()?;

    let (page, total) = manager
        .list(status, limit, offset)
        .await
        .map_err(|e| e.to_string())?;

    let rows: Vec<ListRow> = page
        .iter()
        .map(|summary| {
            let succeeded = summary.task_counts.get("SUCCEEDED").copied().unwrap_or(0);
            ListRow {
                id: summary.id.clone(),
                status: summary.status,
                proposal_id: summary.proposal_id.clone(),
                created: summary.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                tasks: format!("{}/{} succeeded", succeeded, summary.task_count),
            }
        })
        .collect();

    Ok(serde_json::json!({
        "total": total,
        "limit": limit,
        "offset": offset,
        "workflows": to_json(&rows)?,
    }))
}
