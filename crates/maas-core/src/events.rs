//! Push notifications layered over workflow state transitions.
//!
//! Events are published only after the corresponding change has been written
//! to the store, so a subscriber that reacts by querying always sees the
//! state the event describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{AgentKind, FailureKind, WorkflowStatus};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        task_count: usize,
    },
    TaskStarted {
        workflow_id: String,
        task_id: String,
        agent: AgentKind,
        attempt: u32,
    },
    TaskRetrying {
        workflow_id: String,
        task_id: String,
        agent: AgentKind,
        attempt: u32,
        kind: FailureKind,
        delay_ms: u64,
    },
    TaskSucceeded {
        workflow_id: String,
        task_id: String,
        agent: AgentKind,
        attempts: u32,
    },
    TaskFailed {
        workflow_id: String,
        task_id: String,
        agent: AgentKind,
        kind: FailureKind,
        message: String,
    },
    TaskSkipped {
        workflow_id: String,
        task_id: String,
        agent: AgentKind,
        reason: String,
    },
    WorkflowFinished {
        workflow_id: String,
        status: WorkflowStatus,
        finished_at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::TaskStarted { workflow_id, .. }
            | Self::TaskRetrying { workflow_id, .. }
            | Self::TaskSucceeded { workflow_id, .. }
            | Self::TaskFailed { workflow_id, .. }
            | Self::TaskSkipped { workflow_id, .. }
            | Self::WorkflowFinished { workflow_id, .. } => workflow_id,
        }
    }
}

/// Broadcast bus for [`WorkflowEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: WorkflowEvent) {
        tracing::debug!(workflow_id = %event.workflow_id(), ?event, "[EventBus] emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
