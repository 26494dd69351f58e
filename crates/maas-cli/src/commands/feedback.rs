//! `maas feedback` — append a human annotation to a workflow.

use maas_core::models::FeedbackInput;
use maas_core::OrchestrationManager;

use super::to_json;

pub async fn submit(
    manager: &OrchestrationManager,
    workflow_id: &str,
    note: &str,
    task_id: Option<&str>,
    rating: Option<u8>,
    author: Option<&str>,
) -> Result<serde_json::Value, String> {
    let input = FeedbackInput {
        task_id: task_id.map(str::to_string),
        annotation: note.to_string(),
        rating,
        author: author.map(str::to_string),
    };
    let stored = manager
        .submit_feedback(workflow_id, input)
        .await
        .map_err(|e| e.to_string())?;
    to_json(&stored)
}
