//! Agent interface.
//!
//! Every agent, specialist or synthesizer, is reached through the single
//! [`Agent::invoke`] operation. The engine treats it as an opaque, possibly
//! slow and flaky remote call: it bounds it with a timeout, retries the
//! retryable failures, and records the rest.

pub mod llm;

pub use llm::LlmAgent;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentsConfig;
use crate::error::OrchestratorError;
use crate::models::{AgentKind, AgentResult, FailureKind, Proposal};

/// Everything an agent sees for one attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workflow_id: String,
    pub task_id: String,
    pub kind: AgentKind,
    pub attempt: u32,
    pub proposal: Arc<Proposal>,
    /// Results of the task's succeeded dependencies, in plan order.
    pub dependency_results: Vec<AgentResult>,
}

/// What a successful invocation returns; the engine turns it into an
/// [`AgentResult`] bound to the task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub findings: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Typed failure of a single agent call.
#[derive(Debug, thiserror::Error)]
pub enum AgentInvocationError {
    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed agent output: {0}")]
    MalformedOutput(String),

    #[error("invalid proposal input: {0}")]
    InvalidInput(String),

    #[error("agent rejected the request: {0}")]
    Rejected(String),

    #[error("agent call cancelled")]
    Cancelled,
}

impl AgentInvocationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Quota(_) => FailureKind::Quota,
            Self::Transport(_) => FailureKind::Transport,
            Self::MalformedOutput(_) => FailureKind::MalformedOutput,
            Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::Rejected(_) => FailureKind::Rejected,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Classify a non-success HTTP status from a reasoning endpoint.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("API returned {}: {}", status, body);
        match status {
            429 => Self::Quota(message),
            500 | 502 | 503 | 504 | 529 => Self::Transport(message),
            400 | 413 | 422 => Self::InvalidInput(message),
            _ => Self::Rejected(message),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentInvocationError>;
}

/// The closed set of agents, one per [`AgentKind`].
#[derive(Clone)]
pub struct AgentSet {
    compliance: Arc<dyn Agent>,
    evaluation: Arc<dyn Agent>,
    market: Arc<dyn Agent>,
    orchestrator: Arc<dyn Agent>,
}

impl AgentSet {
    pub fn new(
        compliance: Arc<dyn Agent>,
        evaluation: Arc<dyn Agent>,
        market: Arc<dyn Agent>,
        orchestrator: Arc<dyn Agent>,
    ) -> Result<Self, OrchestratorError> {
        let set = Self {
            compliance,
            evaluation,
            market,
            orchestrator,
        };
        for kind in AgentKind::ALL {
            let actual = set.get(kind).kind();
            if actual != kind {
                return Err(OrchestratorError::Config(format!(
                    "{} slot holds a {} agent",
                    kind, actual
                )));
            }
        }
        Ok(set)
    }

    /// Build every slot with the same constructor.
    pub fn from_factory<F>(mut factory: F) -> Result<Self, OrchestratorError>
    where
        F: FnMut(AgentKind) -> Arc<dyn Agent>,
    {
        Self::new(
            factory(AgentKind::Compliance),
            factory(AgentKind::Evaluation),
            factory(AgentKind::Market),
            factory(AgentKind::Orchestrator),
        )
    }

    /// HTTP-backed agents, each with its own injected endpoint settings.
    pub fn from_config(config: &AgentsConfig) -> Result<Self, OrchestratorError> {
        Self::new(
            Arc::new(LlmAgent::new(AgentKind::Compliance, config.compliance.clone())?),
            Arc::new(LlmAgent::new(AgentKind::Evaluation, config.evaluation.clone())?),
            Arc::new(LlmAgent::new(AgentKind::Market, config.market.clone())?),
            Arc::new(LlmAgent::new(AgentKind::Orchestrator, config.orchestrator.clone())?),
        )
    }

    pub fn get(&self, kind: AgentKind) -> Arc<dyn Agent> {
        match kind {
            AgentKind::Compliance => self.compliance.clone(),
            AgentKind::Evaluation => self.evaluation.clone(),
            AgentKind::Market => self.market.clone(),
            AgentKind::Orchestrator => self.orchestrator.clone(),
        }
    }
}
