//! Executor / Planner / Replanner (C5, spec §4.5): breaks a message into an
//! ordered step plan, runs steps through a `ToolRuntime`, and classifies
//! failures into retry / alternative-tool / approval / abort decisions.

mod executor;
mod plan;
mod replan;

pub use executor::{ExecutionOutcome, Executor};
pub use plan::{KeywordPlanner, Plan, PlanStep, PlanValidationError, Planner, topological_order, validate_plan};
pub use replan::{FailureKind, RecoveryActionKind, RecoveryAttempt, Replanner, classify};
