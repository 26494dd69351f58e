//! HTTP agent that asks a hosted language model for a structured assessment.
//!
//! Two wire formats are supported: the Anthropic Messages API and
//! OpenAI-compatible chat completions. The model is asked to answer with a
//! single JSON object; that object becomes the task's findings.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Agent, AgentInvocationError, AgentOutput, AgentRequest};
use crate::config::{AdapterKind, AgentEndpointConfig};
use crate::error::OrchestratorError;
use crate::models::AgentKind;

const COMPLIANCE_SYSTEM_PROMPT: &str = "You are a procurement compliance reviewer. \
Check the proposal against applicable procurement regulations, required certifications, \
contract terms and the declared regulatory domain. Respond with a single JSON object: \
{\"compliant\": bool, \"issues\": [{\"severity\": \"low|medium|high\", \"description\": string}], \
\"score\": number between 0 and 1, \"summary\": string}.";

const EVALUATION_SYSTEM_PROMPT: &str = "You are a procurement evaluator. Assess the \
proposal's technical approach, delivery risk and value for money. Respond with a single \
JSON object: {\"strengths\": [string], \"weaknesses\": [string], \"risks\": [string], \
\"score\": number between 0 and 1, \"summary\": string}.";

const MARKET_SYSTEM_PROMPT: &str = "You are a market analyst for public procurement. \
Compare the proposal's pricing and terms with typical market rates for the category and \
contract size, and note alternative vendors where relevant. Respond with a single JSON \
object: {\"price_assessment\": \"below|at|above market\", \"alternatives\": [string], \
\"score\": number between 0 and 1, \"summary\": string}.";

const ORCHESTRATOR_SYSTEM_PROMPT: &str = "You synthesize specialist assessments of a \
procurement proposal into one recommendation. Only the assessments provided are \
available; do not invent findings for missing ones. Respond with a single JSON object: \
{\"overall_recommendation\": \"approve|approve_with_conditions|reject\", \
\"rationale\": string, \"conditions\": [string], \"score\": number between 0 and 1, \
\"summary\": string}.";

/// Calls one reasoning endpoint on behalf of one agent kind.
pub struct LlmAgent {
    kind: AgentKind,
    config: AgentEndpointConfig,
    client: reqwest::Client,
}

impl LlmAgent {
    pub fn new(kind: AgentKind, config: AgentEndpointConfig) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| OrchestratorError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            kind,
            config,
            client,
        })
    }

    fn system_prompt(&self) -> &str {
        if let Some(prompt) = self.config.system_prompt.as_deref() {
            return prompt;
        }
        match self.kind {
            AgentKind::Compliance => COMPLIANCE_SYSTEM_PROMPT,
            AgentKind::Evaluation => EVALUATION_SYSTEM_PROMPT,
            AgentKind::Market => MARKET_SYSTEM_PROMPT,
            AgentKind::Orchestrator => ORCHESTRATOR_SYSTEM_PROMPT,
        }
    }

    async fn call_anthropic(&self, user_prompt: &str) -> Result<String, AgentInvocationError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": self.system_prompt(),
            "messages": [{ "role": "user", "content": user_prompt }],
        });
        if let Some(temp) = self.config.temperature {
            body["temperature"] = json!(temp);
        }

        tracing::debug!(agent = %self.kind, %url, model = %self.config.model, "[LlmAgent] calling Anthropic API");
        let json = self
            .send(
                self.client
                    .post(&url)
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body),
            )
            .await?;

        if json.get("stop_reason").and_then(Value::as_str) == Some("refusal") {
            return Err(AgentInvocationError::Rejected("model refused the request".into()));
        }
        json.get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .map(str::to_string)
                    .reduce(|a, b| format!("{}\n{}", a, b))
            })
            .ok_or_else(|| AgentInvocationError::MalformedOutput("response has no text content".into()))
    }

    async fn call_openai(&self, user_prompt: &str) -> Result<String, AgentInvocationError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [
                { "role": "system", "content": self.system_prompt() },
                { "role": "user", "content": user_prompt },
            ],
        });
        if let Some(temp) = self.config.temperature {
            body["temperature"] = json!(temp);
        }

        tracing::debug!(agent = %self.kind, %url, model = %self.config.model, "[LlmAgent] calling chat completions API");
        let json = self
            .send(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.config.api_key))
                    .json(&body),
            )
            .await?;

        let choice = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());
        if choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str) == Some("content_filter") {
            return Err(AgentInvocationError::Rejected("response blocked by content filter".into()));
        }
        choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentInvocationError::MalformedOutput("response has no message content".into()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, AgentInvocationError> {
        let response = request
            .header("content-type", "application/json")
            .send()
            .await
            .map_err(|e| AgentInvocationError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentInvocationError::Transport(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(AgentInvocationError::from_status(status.as_u16(), &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| AgentInvocationError::MalformedOutput(format!("Failed to parse response JSON: {}", e)))
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentInvocationError> {
        let prompt = build_user_prompt(request)?;
        let text = match self.config.adapter {
            AdapterKind::Anthropic => self.call_anthropic(&prompt).await?,
            AdapterKind::Openai => self.call_openai(&prompt).await?,
        };
        parse_agent_output(&text)
    }
}

/// Proposal plus the findings of completed dependencies, as JSON.
pub fn build_user_prompt(request: &AgentRequest) -> Result<String, AgentInvocationError> {
    let proposal = serde_json::to_value(request.proposal.as_ref())
        .map_err(|e| AgentInvocationError::InvalidInput(e.to_string()))?;
    let mut prompt = format!(
        "Proposal under review:\n{}\n",
        serde_json::to_string_pretty(&proposal).unwrap_or_default()
    );
    if !request.dependency_results.is_empty() {
        let assessments: Vec<Value> = request
            .dependency_results
            .iter()
            .map(|r| {
                json!({
                    "agent": r.agent,
                    "score": r.score,
                    "summary": r.summary,
                    "findings": r.findings,
                })
            })
            .collect();
        prompt.push_str("\nSpecialist assessments:\n");
        prompt.push_str(&serde_json::to_string_pretty(&assessments).unwrap_or_default());
        prompt.push('\n');
    }
    prompt.push_str("\nAnswer with the JSON object only.");
    Ok(prompt)
}

/// Extract the JSON object from a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_agent_output(text: &str) -> Result<AgentOutput, AgentInvocationError> {
    let body = strip_code_fence(text.trim());
    let candidate = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => {
            return Err(AgentInvocationError::MalformedOutput(
                "reply contains no JSON object".into(),
            ))
        }
    };
    let findings: Value = serde_json::from_str(candidate)
        .map_err(|e| AgentInvocationError::MalformedOutput(format!("invalid JSON in reply: {}", e)))?;

    let score = ["score", "overall_score", "confidence"]
        .iter()
        .find_map(|key| findings.get(*key).and_then(Value::as_f64));
    let summary = findings
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(AgentOutput {
        findings,
        score,
        summary,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line, e.g. "```json".
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest)
}
