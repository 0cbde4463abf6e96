//! Planning module.
//!
//! This module compares the desired graph with recorded state, produces
//! executable plans and runs them:
//! - Plan, change and step types
//! - The diff engine (differencer)
//! - The plan executor (scheduler)

mod diff;
mod executor;
mod plan;

pub use diff::DiffEngine;
pub use executor::{
    ApplyReport, PlanExecutor, StepReport, StepStatus, DEFAULT_PARALLELISM,
};
pub use plan::{Action, Change, Operation, Plan, PlanStep, PlanSummary, StepId};
