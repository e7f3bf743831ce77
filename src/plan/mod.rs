// src/plan/mod.rs
//! Command Plan State Machine (spec §3 Plan/Step, §4.6 C6).

mod model;
mod orchestrator;

pub use model::{Decision, Plan, Risk, Step, StepResult, StepState};
pub use orchestrator::{PlanOrchestrator, PlanStore, StepOutcome};
