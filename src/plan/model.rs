// src/plan/model.rs
//! Plan/Step data types (spec §3). A `Plan` is immutable once validated;
//! only `Step.state`/`decision`/`result` mutate, and only through the
//! transitions `orchestrator.rs` enforces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Approved,
    Rejected,
    Executing,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Rejected | StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: std::time::Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub command: String,
    pub explanation: String,
    pub expected_duration_hint: Option<u64>,
    pub risk: Risk,
    pub state: StepState,
    pub decision: Option<Decision>,
    pub result: Option<StepResult>,
}

impl Step {
    pub fn new(index: usize, command: String, explanation: String, expected_duration_hint: Option<u64>, risk: Risk) -> Self {
        Step {
            index,
            command,
            explanation,
            expected_duration_hint,
            risk,
            state: StepState::Pending,
            decision: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub session_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub request_text: String,
    pub intent: String,
    pub action: String,
    pub explanation: String,
    pub overall_risk: Risk,
    pub steps: Vec<Step>,
    pub discussion: Vec<(String, String)>,
}

impl Plan {
    /// The index of the smallest pending step, i.e. the only step index
    /// `respond` may currently act on (spec §4.6 sequential approval).
    pub fn next_pending_index(&self) -> Option<usize> {
        self.steps.iter().find(|s| s.state == StepState::Pending).map(|s| s.index)
    }

    /// A plan is resolved once every step has reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }

    /// Succeeded iff every step is succeeded or skipped; failed otherwise.
    /// Only meaningful once `is_resolved()` is true.
    pub fn resolved_successfully(&self) -> bool {
        self.steps.iter().all(|s| matches!(s.state, StepState::Succeeded | StepState::Skipped))
    }

    pub fn recompute_overall_risk(&mut self) {
        self.overall_risk = self.steps.iter().map(|s| s.risk).max().unwrap_or(Risk::Low);
    }
}
