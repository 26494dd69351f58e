use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of agents a workflow can run.
///
/// Declaration order is significant: it is the plan order and the ordering
/// used wherever results are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    Compliance,
    Evaluation,
    Market,
    Orchestrator,
}

impl AgentKind {
    /// The three independent specialists, in plan order.
    pub const SPECIALISTS: [AgentKind; 3] =
        [AgentKind::Compliance, AgentKind::Evaluation, AgentKind::Market];

    pub const ALL: [AgentKind; 4] = [
        AgentKind::Compliance,
        AgentKind::Evaluation,
        AgentKind::Market,
        AgentKind::Orchestrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliance => "COMPLIANCE",
            Self::Evaluation => "EVALUATION",
            Self::Market => "MARKET",
            Self::Orchestrator => "ORCHESTRATOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COMPLIANCE" => Some(Self::Compliance),
            "EVALUATION" => Some(Self::Evaluation),
            "MARKET" => Some(Self::Market),
            "ORCHESTRATOR" => Some(Self::Orchestrator),
            _ => None,
        }
    }

    /// Short lowercase label used in task ids and log fields.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Compliance => "compliance",
            Self::Evaluation => "evaluation",
            Self::Market => "market",
            Self::Orchestrator => "orchestrator",
        }
    }

    pub fn is_specialist(&self) -> bool {
        !matches!(self, Self::Orchestrator)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Forward-only state machine.
    ///
    /// `Running -> Running` is allowed so a retry can record its attempt
    /// number; `Pending -> Failed` covers workflow timeout and cancellation of
    /// tasks that were never dispatched.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Failed | Self::Skipped) => true,
            (Self::Running, Self::Running | Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

/// How many of a task's dependencies must succeed before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DependencyPolicy {
    /// Every dependency must succeed; any failure skips the task.
    #[default]
    All,
    /// Runs once every dependency is terminal and at least `count` succeeded.
    AtLeast { count: usize },
}

/// What the readiness check decided for a pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// The task can never run; carries the dependency-failure reason.
    Blocked(String),
}

/// A unit of work in a workflow plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    pub workflow_id: String,
    pub kind: AgentKind,
    /// Ids of the tasks this one depends on.
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub policy: DependencyPolicy,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(workflow_id: &str, kind: AgentKind) -> Self {
        Self {
            id: task_id(workflow_id, kind),
            workflow_id: workflow_id.to_string(),
            kind,
            dependencies: Vec::new(),
            policy: DependencyPolicy::All,
            status: TaskStatus::Pending,
            attempts: 0,
            skip_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>, policy: DependencyPolicy) -> Self {
        self.dependencies = dependencies;
        self.policy = policy;
        self
    }

    /// Decide whether this task can be dispatched given the current status of
    /// every task in the plan.
    pub fn readiness<F>(&self, status_of: F) -> Readiness
    where
        F: Fn(&str) -> Option<TaskStatus>,
    {
        let mut succeeded = 0usize;
        let mut unfinished = 0usize;
        let mut failed: Vec<&str> = Vec::new();

        for dep in &self.dependencies {
            match status_of(dep) {
                Some(TaskStatus::Succeeded) => succeeded += 1,
                Some(TaskStatus::Failed) | Some(TaskStatus::Skipped) => failed.push(dep),
                Some(_) => unfinished += 1,
                None => failed.push(dep),
            }
        }

        match self.policy {
            DependencyPolicy::All => {
                if !failed.is_empty() {
                    Readiness::Blocked(format!("dependency failed: {}", failed.join(", ")))
                } else if unfinished > 0 {
                    Readiness::Waiting
                } else {
                    Readiness::Ready
                }
            }
            DependencyPolicy::AtLeast { count } => {
                if succeeded + unfinished < count {
                    Readiness::Blocked(format!(
                        "only {} of {} required dependencies can succeed; failed: {}",
                        succeeded + unfinished,
                        count,
                        failed.join(", ")
                    ))
                } else if unfinished > 0 {
                    Readiness::Waiting
                } else {
                    Readiness::Ready
                }
            }
        }
    }
}

/// Task ids are derived from the workflow id so child rows stay readable.
pub fn task_id(workflow_id: &str, kind: AgentKind) -> String {
    format!("{}-{}", workflow_id, kind.slug())
}

/// Why an agent task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// A single attempt exceeded the per-task timeout.
    Timeout,
    /// The reasoning service rejected the call for rate/quota reasons.
    Quota,
    /// Network or upstream server error.
    Transport,
    /// The agent answered but its output could not be parsed.
    MalformedOutput,
    /// The proposal input was rejected as invalid.
    InvalidInput,
    /// The agent explicitly refused the request.
    Rejected,
    Cancelled,
    WorkflowTimeout,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Quota => "QUOTA",
            Self::Transport => "TRANSPORT",
            Self::MalformedOutput => "MALFORMED_OUTPUT",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::WorkflowTimeout => "WORKFLOW_TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TIMEOUT" => Some(Self::Timeout),
            "QUOTA" => Some(Self::Quota),
            "TRANSPORT" => Some(Self::Transport),
            "MALFORMED_OUTPUT" => Some(Self::MalformedOutput),
            "INVALID_INPUT" => Some(Self::InvalidInput),
            "REJECTED" => Some(Self::Rejected),
            "CANCELLED" => Some(Self::Cancelled),
            "WORKFLOW_TIMEOUT" => Some(Self::WorkflowTimeout),
            "INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Quota | Self::Transport | Self::MalformedOutput
        )
    }
}

/// Output of a successful agent task. Produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub task_id: String,
    pub agent: AgentKind,
    /// Agent-specific structured payload.
    pub findings: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Dependency task ids whose results were given to the agent.
    #[serde(default)]
    pub inputs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal failure record for a task that exhausted its retries or could
/// not run at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFailure {
    pub task_id: String,
    pub agent: AgentKind,
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl AgentFailure {
    pub fn new(task: &AgentTask, kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            agent: task.kind,
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            attempts,
            created_at: Utc::now(),
        }
    }
}
