use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feedback::HumanFeedback;
use super::task::{AgentFailure, AgentKind, AgentResult, AgentTask, FailureKind, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    PartiallyFailed,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::PartiallyFailed => "PARTIALLY_FAILED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PARTIALLY_FAILED" => Some(Self::PartiallyFailed),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label describing how thorough the selected plan is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    /// All three specialists plus synthesis.
    Standard,
    /// At least one specialist was not selected.
    Expedited,
    /// High-value proposal with the full specialist set.
    Comprehensive,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Expedited => "EXPEDITED",
            Self::Comprehensive => "COMPREHENSIVE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STANDARD" => Some(Self::Standard),
            "EXPEDITED" => Some(Self::Expedited),
            "COMPREHENSIVE" => Some(Self::Comprehensive),
            _ => None,
        }
    }
}

/// One end-to-end evaluation run for a single proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub proposal_id: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    /// Tasks in plan order.
    pub plan: Vec<AgentTask>,
    #[serde(default)]
    pub results: Vec<AgentResult>,
    #[serde(default)]
    pub failures: Vec<AgentFailure>,
    #[serde(default)]
    pub feedback: Vec<HumanFeedback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<FinalRecommendation>,
    #[serde(default)]
    pub diagnostics: Vec<TaskDiagnostic>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(id: String, proposal_id: String, workflow_type: WorkflowType, plan: Vec<AgentTask>) -> Self {
        let now = Utc::now();
        Self {
            id,
            proposal_id,
            workflow_type,
            status: WorkflowStatus::Pending,
            plan,
            results: Vec::new(),
            failures: Vec::new(),
            feedback: Vec::new(),
            recommendation: None,
            diagnostics: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&AgentTask> {
        self.plan.iter().find(|t| t.id == task_id)
    }

    pub fn task_by_kind(&self, kind: AgentKind) -> Option<&AgentTask> {
        self.plan.iter().find(|t| t.kind == kind)
    }

    pub fn result_for(&self, task_id: &str) -> Option<&AgentResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    pub fn failure_for(&self, task_id: &str) -> Option<&AgentFailure> {
        self.failures.iter().find(|f| f.task_id == task_id)
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.plan.iter().all(|t| t.status.is_terminal())
    }

    pub fn summary(&self) -> WorkflowSummary {
        let mut task_counts = BTreeMap::new();
        for task in &self.plan {
            *task_counts.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }
        WorkflowSummary {
            id: self.id.clone(),
            proposal_id: self.proposal_id.clone(),
            workflow_type: self.workflow_type,
            status: self.status,
            task_count: self.plan.len(),
            task_counts,
            feedback_count: self.feedback.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }

    /// The result view for a terminal workflow.
    pub fn report(&self) -> WorkflowReport {
        let processing_time_ms = self
            .completed_at
            .map(|done| (done - self.created_at).num_milliseconds().max(0) as u64);
        WorkflowReport {
            workflow_id: self.id.clone(),
            proposal_id: self.proposal_id.clone(),
            workflow_type: self.workflow_type,
            status: self.status,
            recommendation: self.recommendation.clone(),
            diagnostics: self.diagnostics.clone(),
            processing_time_ms,
        }
    }
}

/// Why a task did not contribute to the recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDiagnostic {
    pub task_id: String,
    pub agent: AgentKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub reason: String,
}

/// The synthesized outcome of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalRecommendation {
    pub workflow_id: String,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// The orchestrator agent's full synthesis payload.
    pub synthesis: serde_json::Value,
    /// Specialists whose results fed the synthesis.
    pub inputs: Vec<AgentKind>,
    /// Findings of every specialist that succeeded, keyed by agent.
    pub findings: BTreeMap<AgentKind, serde_json::Value>,
    /// Specialists that failed or were skipped.
    pub missing: Vec<TaskDiagnostic>,
    pub synthesized_at: DateTime<Utc>,
}

/// What aggregation produced for a terminal plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<FinalRecommendation>,
    pub diagnostics: Vec<TaskDiagnostic>,
}

/// Status view of a workflow (no payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub proposal_id: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub task_count: usize,
    /// Number of tasks per task status.
    pub task_counts: BTreeMap<String, usize>,
    pub feedback_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result view of a terminal workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub proposal_id: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<FinalRecommendation>,
    pub diagnostics: Vec<TaskDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}
