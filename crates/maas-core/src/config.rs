//! Runtime configuration loaded from YAML.
//!
//! ```yaml
//! db_path: "maas.db"
//! engine:
//!   max_retries: 2
//!   task_timeout_secs: 120
//!   max_concurrent_agent_calls: 4
//! planner:
//!   skip_market_for_sole_source_renewal: true
//! agents:
//!   compliance:
//!     adapter: anthropic
//!     base_url: "${ANTHROPIC_BASE_URL:-https://api.anthropic.com}"
//!     api_key: "${ANTHROPIC_API_KEY}"
//!     model: "claude-sonnet-4-5"
//! ```
//!
//! Every string value may reference environment variables as `${VAR}` or
//! `${VAR:-default}`; references are expanded once at load time.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::models::AgentKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaasConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub agents: AgentsConfig,
}

fn default_db_path() -> String {
    "maas.db".to_string()
}

impl Default for MaasConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            engine: EngineConfig::default(),
            planner: PlannerConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

/// Retry, timeout and admission-control settings for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Additional attempts after the first one for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Budget for a single agent attempt.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Wall-clock budget for the whole workflow.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Upper bound on agent calls in flight across all workflows.
    #[serde(default = "default_max_concurrent_agent_calls")]
    pub max_concurrent_agent_calls: usize,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_workflow_timeout_secs() -> u64 {
    600
}

fn default_max_concurrent_agent_calls() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            max_concurrent_agent_calls: default_max_concurrent_agent_calls(),
        }
    }
}

impl EngineConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }
}

/// Knobs for the default agent-selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Compliance runs for contracts at or above this value, and always when
    /// the proposal declares a regulatory domain.
    #[serde(default)]
    pub compliance_min_value: f64,

    #[serde(default = "default_true")]
    pub skip_market_for_sole_source_renewal: bool,

    /// Contracts at or above this value are labelled comprehensive.
    #[serde(default = "default_comprehensive_min_value")]
    pub comprehensive_min_value: f64,

    /// Specialist results the orchestrator needs before it can synthesize.
    #[serde(default = "default_min_synthesis_inputs")]
    pub min_synthesis_inputs: usize,
}

fn default_true() -> bool {
    true
}

fn default_comprehensive_min_value() -> f64 {
    1_000_000.0
}

fn default_min_synthesis_inputs() -> usize {
    1
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            compliance_min_value: 0.0,
            skip_market_for_sole_source_renewal: default_true(),
            comprehensive_min_value: default_comprehensive_min_value(),
            min_synthesis_inputs: default_min_synthesis_inputs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub compliance: AgentEndpointConfig,
    #[serde(default)]
    pub evaluation: AgentEndpointConfig,
    #[serde(default)]
    pub market: AgentEndpointConfig,
    #[serde(default)]
    pub orchestrator: AgentEndpointConfig,
}

impl AgentsConfig {
    pub fn get(&self, kind: AgentKind) -> &AgentEndpointConfig {
        match kind {
            AgentKind::Compliance => &self.compliance,
            AgentKind::Evaluation => &self.evaluation,
            AgentKind::Market => &self.market,
            AgentKind::Orchestrator => &self.orchestrator,
        }
    }

    fn get_mut(&mut self, kind: AgentKind) -> &mut AgentEndpointConfig {
        match kind {
            AgentKind::Compliance => &mut self.compliance,
            AgentKind::Evaluation => &mut self.evaluation,
            AgentKind::Market => &mut self.market,
            AgentKind::Orchestrator => &mut self.orchestrator,
        }
    }
}

/// Wire protocol spoken by a reasoning endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Anthropic Messages API (`POST {base_url}/v1/messages`).
    #[default]
    Anthropic,
    /// OpenAI-compatible chat completions (`POST {base_url}/chat/completions`).
    #[serde(alias = "azure", alias = "openai_compatible")]
    Openai,
}

/// Connection settings for one agent's reasoning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    #[serde(default)]
    pub adapter: AdapterKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Replaces the built-in system prompt for this agent.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// HTTP request timeout for one call to the endpoint.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: None,
            max_tokens: default_max_tokens(),
            system_prompt: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AgentEndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn resolve_env(&mut self) {
        self.base_url = resolve_env_vars(&self.base_url);
        self.api_key = resolve_env_vars(&self.api_key);
        self.model = resolve_env_vars(&self.model);
        if let Some(prompt) = self.system_prompt.as_mut() {
            *prompt = resolve_env_vars(prompt);
        }
    }
}

impl MaasConfig {
    /// Parse a YAML document, expand env references, and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self, OrchestratorError> {
        let mut config: MaasConfig = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.db_path = resolve_env_vars(&config.db_path);
        for kind in AgentKind::ALL {
            config.agents.get_mut(kind).resolve_env();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let engine = &self.engine;
        if engine.max_concurrent_agent_calls == 0 {
            return Err(OrchestratorError::Config(
                "engine.max_concurrent_agent_calls must be at least 1".into(),
            ));
        }
        if engine.task_timeout_secs == 0 || engine.workflow_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "engine timeouts must be greater than zero".into(),
            ));
        }
        if engine.max_backoff_ms < engine.base_backoff_ms {
            return Err(OrchestratorError::Config(
                "engine.max_backoff_ms must not be smaller than engine.base_backoff_ms".into(),
            ));
        }
        for kind in AgentKind::ALL {
            if self.agents.get(kind).request_timeout_secs == 0 {
                return Err(OrchestratorError::Config(format!(
                    "agents.{}.request_timeout_secs must be greater than zero",
                    kind.slug()
                )));
            }
        }
        if self.planner.min_synthesis_inputs == 0 {
            return Err(OrchestratorError::Config(
                "planner.min_synthesis_inputs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
/// Unset variables without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    static ENV_REF: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = ENV_REF
        .get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
    else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}
