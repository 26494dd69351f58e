use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// A submitted procurement proposal. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub title: String,
    /// Free-form proposal body (description, technical approach, pricing notes).
    #[serde(default)]
    pub content: String,
    pub metadata: ProposalMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Characteristics the planner uses to select agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalMetadata {
    pub contract_value: f64,
    pub category: String,
    pub vendor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_months: Option<u32>,
    /// Regulatory domain, e.g. "federal" or "healthcare".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regulatory_domain: Option<String>,
    #[serde(default)]
    pub renewal: bool,
    #[serde(default)]
    pub sole_source: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub additional: HashMap<String, serde_json::Value>,
}

impl Proposal {
    /// Reject proposals no agent could meaningfully evaluate.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::BadRequest("proposal id is required".into()));
        }
        if self.title.trim().is_empty() {
            return Err(OrchestratorError::BadRequest(format!(
                "proposal {} has no title",
                self.id
            )));
        }
        let value = self.metadata.contract_value;
        if !value.is_finite() || value < 0.0 {
            return Err(OrchestratorError::BadRequest(format!(
                "proposal {} has invalid contract value {}",
                self.id, value
            )));
        }
        Ok(())
    }

    /// Parse a proposal from JSON (CLI input files, API payloads).
    pub fn from_json(json: &str) -> Result<Self, OrchestratorError> {
        serde_json::from_str(json)
            .map_err(|e| OrchestratorError::BadRequest(format!("Failed to parse proposal JSON: {}", e)))
    }
}
