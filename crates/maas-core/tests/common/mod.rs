//! Scripted in-process agents and fixtures shared by the integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use maas_core::config::{EngineConfig, MaasConfig};
use maas_core::models::{AgentKind, Proposal, ProposalMetadata};
use maas_core::{
    Agent, AgentInvocationError, AgentOutput, AgentRequest, AgentSet, OrchestrationManager,
    WorkflowStore,
};

/// What a scripted agent does on one call.
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail(fn() -> AgentInvocationError),
    /// Never returns; only the engine's timeout ends the call.
    Hang,
    Panic,
}

/// Tracks how many agent calls are in flight at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

pub struct ScriptedAgent {
    kind: AgentKind,
    delay: Mutex<Duration>,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Mutex<Behavior>,
    calls: AtomicU32,
    gauge: Arc<Gauge>,
    seen_inputs: Mutex<Vec<Vec<String>>>,
}

impl ScriptedAgent {
    pub fn new(kind: AgentKind, gauge: Arc<Gauge>) -> Self {
        Self {
            kind,
            delay: Mutex::new(Duration::from_millis(10)),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Behavior::Succeed),
            calls: AtomicU32::new(0),
            gauge,
            seen_inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Queue behaviors for the next calls, in order.
    pub fn then(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    /// Behavior once the queue is empty.
    pub fn otherwise(&self, behavior: Behavior) {
        *self.fallback.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Dependency task ids passed in on each call.
    pub fn seen_inputs(&self) -> Vec<Vec<String>> {
        self.seen_inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inputs: Vec<String> = request
            .dependency_results
            .iter()
            .map(|r| r.task_id.clone())
            .collect();
        self.seen_inputs.lock().unwrap().push(inputs.clone());

        let behavior = {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(*self.fallback.lock().unwrap())
        };
        let delay = *self.delay.lock().unwrap();

        self.gauge.enter();
        let _guard = GaugeGuard(&self.gauge);
        match behavior {
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Panic => panic!("{} agent blew up", self.kind.slug()),
            _ => tokio::time::sleep(delay).await,
        }

        match behavior {
            Behavior::Fail(make) => Err(make()),
            _ => Ok(self.output(request, inputs)),
        }
    }
}

impl ScriptedAgent {
    fn output(&self, request: &AgentRequest, inputs: Vec<String>) -> AgentOutput {
        match self.kind {
            AgentKind::Orchestrator => AgentOutput {
                findings: json!({
                    "overall_recommendation": "approve",
                    "synthesized_from": inputs,
                }),
                score: Some(0.82),
                summary: Some(format!("Approve {}", request.proposal.title)),
            },
            kind => AgentOutput {
                findings: json!({ "agent": kind.slug(), "proposal": request.proposal.id }),
                score: Some(0.7),
                summary: None,
            },
        }
    }
}

/// One scripted agent per kind, sharing a concurrency gauge.
pub struct Agents {
    pub compliance: Arc<ScriptedAgent>,
    pub evaluation: Arc<ScriptedAgent>,
    pub market: Arc<ScriptedAgent>,
    pub orchestrator: Arc<ScriptedAgent>,
    pub gauge: Arc<Gauge>,
}

impl Agents {
    pub fn new() -> Self {
        let gauge = Arc::new(Gauge::default());
        let make = |kind| Arc::new(ScriptedAgent::new(kind, gauge.clone()));
        Self {
            compliance: make(AgentKind::Compliance),
            evaluation: make(AgentKind::Evaluation),
            market: make(AgentKind::Market),
            orchestrator: make(AgentKind::Orchestrator),
            gauge: gauge.clone(),
        }
    }

    pub fn get(&self, kind: AgentKind) -> &Arc<ScriptedAgent> {
        match kind {
            AgentKind::Compliance => &self.compliance,
            AgentKind::Evaluation => &self.evaluation,
            AgentKind::Market => &self.market,
            AgentKind::Orchestrator => &self.orchestrator,
        }
    }

    pub fn set(&self) -> AgentSet {
        AgentSet::from_factory(|kind| self.get(kind).clone() as Arc<dyn Agent>)
            .expect("scripted agents match their slots")
    }
}

/// Short timeouts and backoff so failure paths finish quickly.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        max_retries: 2,
        base_backoff_ms: 20,
        max_backoff_ms: 100,
        task_timeout_secs: 1,
        workflow_timeout_secs: 30,
        max_concurrent_agent_calls: 4,
    }
}

pub fn config_with(engine: EngineConfig) -> MaasConfig {
    MaasConfig {
        engine,
        ..MaasConfig::default()
    }
}

pub fn manager(store: Arc<dyn WorkflowStore>, agents: &Agents, engine: EngineConfig) -> OrchestrationManager {
    OrchestrationManager::new(store, agents.set(), &config_with(engine))
}

pub fn proposal(id: &str) -> Proposal {
    Proposal {
        id: id.to_string(),
        title: "Data center network refresh".to_string(),
        content: "Replace core switches across two sites; five-year support.".to_string(),
        metadata: ProposalMetadata {
            contract_value: 250_000.0,
            category: "IT infrastructure".to_string(),
            vendor: "NetCo".to_string(),
            duration_months: Some(60),
            regulatory_domain: None,
            renewal: false,
            sole_source: false,
            additional: Default::default(),
        },
        submitted_by: Some("buyer@example.com".to_string()),
        created_at: Utc::now(),
    }
}

pub fn timeout_error() -> AgentInvocationError {
    AgentInvocationError::Timeout(Duration::from_secs(1))
}

pub fn quota_error() -> AgentInvocationError {
    AgentInvocationError::Quota("rate limited".to_string())
}

pub fn rejected_error() -> AgentInvocationError {
    AgentInvocationError::Rejected("refused to evaluate".to_string())
}

pub fn malformed_error() -> AgentInvocationError {
    AgentInvocationError::MalformedOutput("expected JSON object".to_string())
}
