//! Workflow lifecycle — planning, execution and aggregation.
//!
//! ```text
//! Proposal ──► WorkflowPlanner ──► Workflow (Pending, persisted)
//!                                       │
//!                                ExecutionEngine ──► Agent × 4
//!                                       │
//!                                   aggregate ──► FinalRecommendation
//! ```

pub mod aggregator;
pub mod executor;
pub mod planner;
pub mod retry;

pub use aggregator::aggregate;
pub use executor::{ExecutionEngine, RunHandle};
pub use planner::{build_plan, validate_dag, PlanningPolicy, ThresholdPolicy, WorkflowPlanner};
pub use retry::RetryPolicy;
