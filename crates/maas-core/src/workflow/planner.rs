//! Workflow Planner — decides which agents run for a proposal and in what order.
//!
//! Specialists are mutually independent; the orchestrator task depends on
//! every selected specialist. Agent selection is a pluggable
//! [`PlanningPolicy`]; [`ThresholdPolicy`] is the configurable default.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::PlannerConfig;
use crate::error::OrchestratorError;
use crate::models::{AgentKind, AgentTask, DependencyPolicy, Proposal, Workflow, WorkflowType};
use crate::store::WorkflowStore;

/// Chooses the specialists a proposal needs.
pub trait PlanningPolicy: Send + Sync {
    /// Specialist kinds that apply. An empty selection means the proposal
    /// cannot be evaluated.
    fn select(&self, proposal: &Proposal) -> Vec<AgentKind>;

    fn workflow_type(&self, proposal: &Proposal, selected: &[AgentKind]) -> WorkflowType;
}

/// Rules driven by contract value and the renewal/sole-source flags.
pub struct ThresholdPolicy {
    config: PlannerConfig,
}

impl ThresholdPolicy {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }
}

impl PlanningPolicy for ThresholdPolicy {
    fn select(&self, proposal: &Proposal) -> Vec<AgentKind> {
        let meta = &proposal.metadata;
        let mut kinds = Vec::with_capacity(3);
        if meta.contract_value >= self.config.compliance_min_value || meta.regulatory_domain.is_some() {
            kinds.push(AgentKind::Compliance);
        }
        kinds.push(AgentKind::Evaluation);
        let sole_source_renewal = meta.renewal && meta.sole_source;
        if !(self.config.skip_market_for_sole_source_renewal && sole_source_renewal) {
            kinds.push(AgentKind::Market);
        }
        kinds
    }

    fn workflow_type(&self, proposal: &Proposal, selected: &[AgentKind]) -> WorkflowType {
        if selected.len() < AgentKind::SPECIALISTS.len() {
            WorkflowType::Expedited
        } else if proposal.metadata.contract_value >= self.config.comprehensive_min_value {
            WorkflowType::Comprehensive
        } else {
            WorkflowType::Standard
        }
    }
}

/// Build the task list for the selected specialists plus the orchestrator.
///
/// Specialists come out in [`AgentKind`] order regardless of selection order;
/// duplicates and any orchestrator entry in `kinds` are ignored.
pub fn build_plan(workflow_id: &str, kinds: &[AgentKind], min_synthesis_inputs: usize) -> Vec<AgentTask> {
    let mut plan: Vec<AgentTask> = AgentKind::SPECIALISTS
        .iter()
        .filter(|kind| kinds.contains(kind))
        .map(|kind| AgentTask::new(workflow_id, *kind))
        .collect();
    if plan.is_empty() {
        return plan;
    }
    let dependencies: Vec<String> = plan.iter().map(|t| t.id.clone()).collect();
    let count = min_synthesis_inputs.clamp(1, dependencies.len());
    plan.push(
        AgentTask::new(workflow_id, AgentKind::Orchestrator)
            .with_dependencies(dependencies, DependencyPolicy::AtLeast { count }),
    );
    plan
}

/// Check that the plan is a DAG and return a topological order (indices
/// into `tasks`).
pub fn validate_dag(tasks: &[AgentTask]) -> Result<Vec<usize>, OrchestratorError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if index.insert(task.id.as_str(), i).is_some() {
            return Err(OrchestratorError::Planning(format!("duplicate task id {}", task.id)));
        }
    }

    let n = tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, task) in tasks.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(OrchestratorError::Planning(format!("task {} depends on itself", task.id)));
            }
            let &d = index.get(dep.as_str()).ok_or_else(|| {
                OrchestratorError::Planning(format!("task {} depends on unknown task {}", task.id, dep))
            })?;
            if tasks[d].kind == AgentKind::Orchestrator {
                return Err(OrchestratorError::Planning(format!(
                    "task {} depends on the orchestrator task",
                    task.id
                )));
            }
            if seen.insert(d) {
                adj[d].push(i);
                in_degree[i] += 1;
            }
        }
        if let DependencyPolicy::AtLeast { count } = task.policy {
            if count == 0 || count > seen.len() {
                return Err(OrchestratorError::Planning(format!(
                    "task {} requires {} of {} dependencies",
                    task.id,
                    count,
                    seen.len()
                )));
            }
        }
    }

    // Kahn's algorithm
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = queue.pop() {
        order.push(node);
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }

    if order.len() != n {
        return Err(OrchestratorError::Planning("plan contains a dependency cycle".into()));
    }
    Ok(order)
}

/// Turns proposals into persisted, Pending workflows.
pub struct WorkflowPlanner {
    store: Arc<dyn WorkflowStore>,
    policy: Arc<dyn PlanningPolicy>,
    config: PlannerConfig,
}

impl WorkflowPlanner {
    pub fn new(store: Arc<dyn WorkflowStore>, config: PlannerConfig) -> Self {
        let policy = Arc::new(ThresholdPolicy::new(config.clone()));
        Self::with_policy(store, policy, config)
    }

    pub fn with_policy(
        store: Arc<dyn WorkflowStore>,
        policy: Arc<dyn PlanningPolicy>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    /// Build the workflow without persisting it.
    pub fn preview(&self, proposal: &Proposal) -> Result<Workflow, OrchestratorError> {
        proposal.validate()?;
        let selected = self.policy.select(proposal);
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let plan = build_plan(&workflow_id, &selected, self.config.min_synthesis_inputs);
        if plan.is_empty() {
            return Err(OrchestratorError::Planning(format!(
                "no agents apply to proposal {}",
                proposal.id
            )));
        }
        validate_dag(&plan)?;
        let specialists: Vec<AgentKind> = plan
            .iter()
            .map(|t| t.kind)
            .filter(AgentKind::is_specialist)
            .collect();
        let workflow_type = self.policy.workflow_type(proposal, &specialists);
        Ok(Workflow::new(workflow_id, proposal.id.clone(), workflow_type, plan))
    }

    /// Build the workflow and persist it (with its proposal) in Pending state.
    pub async fn plan(&self, proposal: &Proposal) -> Result<Workflow, OrchestratorError> {
        let workflow = self.preview(proposal)?;
        self.store.create(proposal, &workflow).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            proposal_id = %proposal.id,
            workflow_type = workflow.workflow_type.as_str(),
            tasks = workflow.plan.len(),
            "[Planner] workflow planned"
        );
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProposalMetadata, TaskStatus, WorkflowStatus};
    use crate::store::InMemoryWorkflowStore;
    use chrono::Utc;

    fn proposal(value: f64, renewal: bool, sole_source: bool) -> Proposal {
        Proposal {
            id: "prop".into(),
            title: "Network refresh".into(),
            content: String::new(),
            metadata: ProposalMetadata {
                contract_value: value,
                category: "IT".into(),
                vendor: "NetCo".into(),
                duration_months: None,
                regulatory_domain: None,
                renewal,
                sole_source,
                additional: Default::default(),
            },
            submitted_by: None,
            created_at: Utc::now(),
        }
    }

    struct NothingApplies;

    impl PlanningPolicy for NothingApplies {
        fn select(&self, _proposal: &Proposal) -> Vec<AgentKind> {
            Vec::new()
        }

        fn workflow_type(&self, _proposal: &Proposal, _selected: &[AgentKind]) -> WorkflowType {
            WorkflowType::Expedited
        }
    }

    #[test]
    fn orchestrator_depends_on_every_selected_specialist() {
        let plan = build_plan("wf", &[AgentKind::Market, AgentKind::Compliance], 1);
        let kinds: Vec<AgentKind> = plan.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![AgentKind::Compliance, AgentKind::Market, AgentKind::Orchestrator]);
        let synthesis = &plan[2];
        assert_eq!(synthesis.dependencies, vec!["wf-compliance", "wf-market"]);
        assert_eq!(synthesis.policy, DependencyPolicy::AtLeast { count: 1 });
        assert!(plan[..2].iter().all(|t| t.dependencies.is_empty()));
        validate_dag(&plan).unwrap();
    }

    #[test]
    fn synthesis_threshold_is_clamped_to_available_inputs() {
        let plan = build_plan("wf", &[AgentKind::Evaluation], 3);
        assert_eq!(plan[1].policy, DependencyPolicy::AtLeast { count: 1 });
    }

    #[test]
    fn cycles_are_rejected() {
        let a = AgentTask::new("wf", AgentKind::Compliance)
            .with_dependencies(vec!["wf-evaluation".into()], DependencyPolicy::All);
        let b = AgentTask::new("wf", AgentKind::Evaluation)
            .with_dependencies(vec!["wf-compliance".into()], DependencyPolicy::All);
        assert!(matches!(validate_dag(&[a, b]), Err(OrchestratorError::Planning(_))));
    }

    #[test]
    fn unknown_and_self_dependencies_are_rejected() {
        let dangling = AgentTask::new("wf", AgentKind::Market)
            .with_dependencies(vec!["wf-legal".into()], DependencyPolicy::All);
        assert!(validate_dag(&[dangling]).is_err());

        let own = AgentTask::new("wf", AgentKind::Market)
            .with_dependencies(vec!["wf-market".into()], DependencyPolicy::All);
        assert!(validate_dag(&[own]).is_err());
    }

    #[test]
    fn specialists_may_not_depend_on_the_orchestrator() {
        let mut plan = build_plan("wf", &[AgentKind::Compliance], 1);
        plan[0].dependencies.push("wf-orchestrator".into());
        assert!(validate_dag(&plan).is_err());
    }

    #[test]
    fn sole_source_renewal_skips_market() {
        let policy = ThresholdPolicy::new(PlannerConfig::default());
        let selected = policy.select(&proposal(50_000.0, true, true));
        assert_eq!(selected, vec![AgentKind::Compliance, AgentKind::Evaluation]);
        assert_eq!(
            policy.workflow_type(&proposal(50_000.0, true, true), &selected),
            WorkflowType::Expedited
        );

        let selected = policy.select(&proposal(50_000.0, true, false));
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn compliance_threshold_and_regulatory_domain() {
        let policy = ThresholdPolicy::new(PlannerConfig {
            compliance_min_value: 100_000.0,
            ..Default::default()
        });
        assert!(!policy.select(&proposal(10_000.0, false, false)).contains(&AgentKind::Compliance));

        let mut regulated = proposal(10_000.0, false, false);
        regulated.metadata.regulatory_domain = Some("healthcare".into());
        assert!(policy.select(&regulated).contains(&AgentKind::Compliance));

        let big = proposal(2_000_000.0, false, false);
        let selected = policy.select(&big);
        assert_eq!(policy.workflow_type(&big, &selected), WorkflowType::Comprehensive);
    }

    #[tokio::test]
    async fn plan_persists_pending_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let planner = WorkflowPlanner::new(store.clone(), PlannerConfig::default());
        let workflow = planner.plan(&proposal(250_000.0, false, false)).await.unwrap();

        let stored = store.get(&workflow.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Pending);
        assert_eq!(stored.plan.len(), 4);
        assert!(stored.plan.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(stored.workflow_type, WorkflowType::Standard);
    }

    #[tokio::test]
    async fn no_applicable_agents_is_a_planning_error() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let planner = WorkflowPlanner::with_policy(
            store.clone(),
            Arc::new(NothingApplies),
            PlannerConfig::default(),
        );
        let err = planner.plan(&proposal(1.0, false, false)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(_)));
        let (_, total) = store.list(None, 10, 0).await.unwrap();
        assert_eq!(total, 0);
    }
}
