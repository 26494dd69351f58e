//! Core error type for MAAS.
//!
//! `OrchestratorError` is returned by every fallible operation in the core
//! domain (planner, stores, engine, facade). Agent call failures have their
//! own type, [`crate::agent::AgentInvocationError`], because the engine absorbs
//! them into the workflow's durable failure record instead of surfacing them.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No agent applies to the proposal, or the plan is not a DAG.
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The operation conflicts with the workflow's current state
    /// (e.g. a backward task transition or a second run of the same workflow).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("JSON error: {}", e))
    }
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }
}
