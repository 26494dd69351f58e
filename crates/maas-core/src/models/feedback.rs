use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// A human annotation on a workflow. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanFeedback {
    /// Position in the workflow's feedback history, assigned by the store.
    pub seq: u64,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub annotation: String,
    /// Optional 1-5 rating.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for submitting feedback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInput {
    pub task_id: Option<String>,
    pub annotation: String,
    pub rating: Option<u8>,
    pub author: Option<String>,
}

impl HumanFeedback {
    /// Validate the input and build an unsequenced feedback record.
    pub fn from_input(workflow_id: &str, input: FeedbackInput) -> Result<Self, OrchestratorError> {
        let annotation = input.annotation.trim();
        if annotation.is_empty() {
            return Err(OrchestratorError::BadRequest(
                "feedback annotation must not be empty".into(),
            ));
        }
        if let Some(rating) = input.rating {
            if !(1..=5).contains(&rating) {
                return Err(OrchestratorError::BadRequest(format!(
                    "rating must be between 1 and 5, got {}",
                    rating
                )));
            }
        }
        Ok(Self {
            seq: 0,
            workflow_id: workflow_id.to_string(),
            task_id: input.task_id,
            annotation: annotation.to_string(),
            rating: input.rating,
            author: input.author,
            created_at: Utc::now(),
        })
    }
}
