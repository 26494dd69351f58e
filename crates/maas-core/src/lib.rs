//! MAAS Core — transport-agnostic domain logic for procurement proposal
//! evaluation.
//!
//! A proposal is planned into a small DAG of agent tasks (Compliance,
//! Evaluation, Market, then the Orchestrator that synthesizes them), run with
//! bounded parallelism, timeouts and retries, and folded into one final
//! recommendation. Workflow state is durable and queryable at any time.
//!
//! This crate has no HTTP server dependency, making it suitable for use in:
//!
//! - CLI tools (via `maas-cli`)
//! - an API service layered over [`OrchestrationManager`]
//! - embedding with the in-memory store

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestration;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use agent::{Agent, AgentInvocationError, AgentOutput, AgentRequest, AgentSet};
pub use config::MaasConfig;
pub use db::Database;
pub use error::OrchestratorError;
pub use events::{EventBus, WorkflowEvent};
pub use orchestration::OrchestrationManager;
pub use store::{InMemoryWorkflowStore, SqliteWorkflowStore, WorkflowStore};
pub use workflow::{ExecutionEngine, RunHandle, WorkflowPlanner};
