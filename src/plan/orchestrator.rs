// src/plan/orchestrator.rs
//! Plan Orchestrator (C6, spec §4.6). Owns every `Plan`'s lifecycle:
//! sequential step approval, per-step execution via C2, terminal-state
//! resolution, and audit emission. Generalized from the shape of the
//! teacher's `session_manager.rs` lifecycle methods (create/attach/
//! terminate), but driving a per-step state machine instead of a
//! per-session one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use crate::config::LimitsConfig;
use crate::errors::{CoreError, OrchestratorError};
use crate::llm::PlanGeneratorPipeline;
use crate::session::{SessionRegistry, SessionStatus};

use super::model::{Decision, Plan, Step, StepResult, StepState};

const MIN_STEP_DEADLINE_SECS: u64 = 5;
const MAX_STEP_DEADLINE_SECS: u64 = 900;

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: StepState,
    pub result: Option<StepResult>,
}

/// In-memory plan store, keyed by `plan_id`. Each plan owns its own mutex
/// (spec §5): step transitions and the execution token both live inside it,
/// so different plans execute fully independently.
pub struct PlanStore {
    plans: RwLock<HashMap<Uuid, Arc<Mutex<Plan>>>>,
}

impl Default for PlanStore {
    fn default() -> Self {
        PlanStore { plans: RwLock::new(HashMap::new()) }
    }
}

pub struct PlanOrchestrator {
    sessions: Arc<SessionRegistry>,
    generator: PlanGeneratorPipeline,
    audit: Arc<dyn AuditSink>,
    limits: LimitsConfig,
    store: PlanStore,
    /// session_id -> plan_id, for the single-unresolved-plan-per-session rule.
    active_plan_by_session: RwLock<HashMap<Uuid, Uuid>>,
}

impl PlanOrchestrator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        generator: PlanGeneratorPipeline,
        audit: Arc<dyn AuditSink>,
        limits: LimitsConfig,
    ) -> Self {
        PlanOrchestrator {
            sessions,
            generator,
            audit,
            limits,
            store: PlanStore::default(),
            active_plan_by_session: RwLock::new(HashMap::new()),
        }
    }

    pub async fn submit(&self, user_id: &str, session_id: Uuid, request_text: &str) -> Result<Plan, CoreError> {
        {
            let active = self.active_plan_by_session.read().await;
            if active.contains_key(&session_id) {
                return Err(OrchestratorError::SessionBusy.into());
            }
        }

        let session = self.sessions.lookup(user_id, session_id).await?;
        if session.status() == SessionStatus::Closed {
            return Err(OrchestratorError::SessionUnavailable.into());
        }

        let profile = session.host_profile().await;
        let deadline = Duration::from_secs(self.limits.generator_deadline_secs);

        let generated = match self.generator.generate(request_text, &profile, deadline).await {
            Ok(generated) => generated,
            Err(e) => {
                self.audit.record(AuditRecord::new(
                    user_id,
                    AuditAction::PlanGenerationFailed,
                    AuditOutcome::Failed,
                    e.to_string(),
                ));
                return Err(e.into());
            }
        };

        let plan = Plan {
            plan_id: Uuid::new_v4(),
            session_id,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            request_text: request_text.to_string(),
            intent: generated.intent,
            action: generated.action,
            explanation: generated.explanation,
            overall_risk: generated.overall_risk,
            steps: generated.steps,
            discussion: Vec::new(),
        };

        let plan_id = plan.plan_id;
        {
            let mut plans = self.store.plans.write().await;
            plans.insert(plan_id, Arc::new(Mutex::new(plan.clone())));
        }
        {
            let mut active = self.active_plan_by_session.write().await;
            active.insert(session_id, plan_id);
        }

        self.audit.record(
            AuditRecord::new(user_id, AuditAction::PlanSubmitted, AuditOutcome::Ok, plan.intent.clone())
                .with_session(session_id)
                .with_plan(plan_id),
        );

        Ok(plan)
    }

    pub async fn get(&self, user_id: &str, plan_id: Uuid) -> Result<Plan, OrchestratorError> {
        let plan_lock = self.plan_lock(plan_id).await?;
        let plan = plan_lock.lock().await;
        if plan.user_id != user_id {
            return Err(OrchestratorError::PlanNotFound(plan_id.to_string()));
        }
        Ok(plan.clone())
    }

    async fn plan_lock(&self, plan_id: Uuid) -> Result<Arc<Mutex<Plan>>, OrchestratorError> {
        let plans = self.store.plans.read().await;
        plans.get(&plan_id).cloned().ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))
    }

    /// Drives the sequential gated approval state machine for one step
    /// (spec §4.6). Serializes through the plan's own mutex, so a second
    /// concurrent caller against the same plan observes the already-updated
    /// state rather than racing the execution.
    pub async fn respond(
        &self,
        user_id: &str,
        plan_id: Uuid,
        step_index: usize,
        approved: bool,
        reason: Option<String>,
    ) -> Result<StepOutcome, OrchestratorError> {
        let plan_lock = self.plan_lock(plan_id).await?;
        let mut plan = plan_lock.lock().await;

        if plan.user_id != user_id {
            return Err(OrchestratorError::PlanNotFound(plan_id.to_string()));
        }

        // Idempotence: a stale respond against an already-resolved plan is a
        // no-op returning current state (spec §8 round-trip law).
        if plan.is_resolved() {
            let step = plan.steps.get(step_index).ok_or(OrchestratorError::InvalidTransition(step_index))?;
            return Ok(StepOutcome { state: step.state, result: step.result.clone() });
        }

        let expected = plan.next_pending_index().ok_or(OrchestratorError::InvalidTransition(step_index))?;
        if step_index != expected {
            return Err(OrchestratorError::OutOfOrder { requested: step_index, expected });
        }

        if !approved {
            self.reject_step(&mut plan, step_index, reason).await;
            self.resolve_if_done(&mut plan).await;
            let session_id = plan.session_id;
            let outcome = StepOutcome {
                state: plan.steps[step_index].state,
                result: plan.steps[step_index].result.clone(),
            };
            drop(plan);
            self.clear_active_if_resolved(plan_id, Some(session_id)).await;
            return Ok(outcome);
        }

        self.approve_and_execute(&mut plan, user_id, step_index, reason).await?;

        let resolved = plan.is_resolved();
        let session_id = plan.session_id;
        let outcome = StepOutcome {
            state: plan.steps[step_index].state,
            result: plan.steps[step_index].result.clone(),
        };
        drop(plan);

        if resolved {
            let mut active = self.active_plan_by_session.write().await;
            if active.get(&session_id) == Some(&plan_id) {
                active.remove(&session_id);
            }
        }

        Ok(outcome)
    }

    /// Iterates `respond` over every remaining pending step in order
    /// (spec §4.6 bulk approval). A failure short-circuits: the
    /// single-step rule auto-skips everything after it.
    pub async fn respond_all(&self, user_id: &str, plan_id: Uuid, approved: bool) -> Result<Plan, OrchestratorError> {
        loop {
            let plan_snapshot = self.get(user_id, plan_id).await?;
            match plan_snapshot.next_pending_index() {
                Some(index) => {
                    let outcome = self.respond(user_id, plan_id, index, approved, None).await?;
                    if matches!(outcome.state, StepState::Failed | StepState::Rejected) {
                        break;
                    }
                }
                None => break,
            }
        }
        self.get(user_id, plan_id).await
    }

    /// Appends a discussion message; never mutates `steps` (spec §12 open
    /// question decision — regeneration is out of scope for this core).
    pub async fn chat(&self, user_id: &str, plan_id: Uuid, message: &str) -> Result<(String, String), OrchestratorError> {
        let plan_lock = self.plan_lock(plan_id).await?;
        let mut plan = plan_lock.lock().await;
        if plan.user_id != user_id {
            return Err(OrchestratorError::PlanNotFound(plan_id.to_string()));
        }

        let ai_message = format!(
            "This plan ({} step(s), overall risk {:?}) is not being regenerated by this message.",
            plan.steps.len(),
            plan.overall_risk
        );
        plan.discussion.push((message.to_string(), ai_message.clone()));

        self.audit.record(
            AuditRecord::new(user_id, AuditAction::ChatMessage, AuditOutcome::Ok, message).with_plan(plan_id),
        );

        Ok((message.to_string(), ai_message))
    }

    async fn reject_step(&self, plan: &mut Plan, step_index: usize, reason: Option<String>) {
        let plan_id = plan.plan_id;
        let user_id = plan.user_id.clone();
        let session_id = plan.session_id;

        {
            let step = &mut plan.steps[step_index];
            step.state = StepState::Rejected;
            step.decision = Some(Decision {
                approved: false,
                reason: reason.unwrap_or_default(),
                at: Utc::now(),
            });
        }

        self.audit.record(
            AuditRecord::new(&user_id, AuditAction::StepRejected, AuditOutcome::Ok, "")
                .with_session(session_id)
                .with_plan(plan_id)
                .with_step(step_index),
        );

        self.skip_remaining(plan, step_index);
    }

    async fn approve_and_execute(
        &self,
        plan: &mut Plan,
        user_id: &str,
        step_index: usize,
        reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let plan_id = plan.plan_id;
        let session_id = plan.session_id;

        {
            let step = &mut plan.steps[step_index];
            step.state = StepState::Approved;
            step.decision = Some(Decision {
                approved: true,
                reason: reason.unwrap_or_default(),
                at: Utc::now(),
            });
        }
        self.audit.record(
            AuditRecord::new(user_id, AuditAction::StepApproved, AuditOutcome::Ok, "")
                .with_session(session_id)
                .with_plan(plan_id)
                .with_step(step_index),
        );

        plan.steps[step_index].state = StepState::Executing;
        self.audit.record(
            AuditRecord::new(user_id, AuditAction::StepExecuting, AuditOutcome::Ok, "")
                .with_session(session_id)
                .with_plan(plan_id)
                .with_step(step_index),
        );

        // A session that vanished entirely (torn down by a concurrent
        // disconnect/beacon_leave) is treated the same as one still present
        // but degraded/closed: the step fails cleanly rather than leaving
        // the plan stuck in `executing` forever (spec §4.6, S5).
        //
        // Deliberate deviation from spec §6's `respond` error list: once a
        // step has already transitioned to `executing` (recorded above,
        // audited, part of the plan's history), a session going away under
        // it is a terminal outcome for that step, not a rejected `respond`
        // call — so it resolves as `Failed` with `SessionUnavailable` in
        // `stderr` rather than surfacing `OrchestratorError::SessionUnavailable`
        // to the caller. `submit` still returns that error directly (see
        // above) for the pre-execution case §6 describes.
        let session = self.sessions.lookup(user_id, session_id).await.ok();
        let unavailable = match &session {
            Some(session) => session.status() == SessionStatus::Closed || session.status() == SessionStatus::Degraded,
            None => true,
        };
        if unavailable {
            let result = StepResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: "session unavailable".to_string(),
                duration: Duration::ZERO,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            };
            plan.steps[step_index].state = StepState::Failed;
            plan.steps[step_index].result = Some(result.clone());
            self.audit.record(
                AuditRecord::new(user_id, AuditAction::StepResult, AuditOutcome::Failed, "session unavailable")
                    .with_session(session_id)
                    .with_plan(plan_id)
                    .with_step(step_index),
            );
            self.skip_remaining(plan, step_index);
            self.resolve_if_done(plan).await;
            return Ok(());
        }

        let session = session.expect("unavailable branch above returns before reaching here");
        let command = plan.steps[step_index].command.clone();
        let step_deadline = self.resolve_step_deadline(plan.steps[step_index].expected_duration_hint);
        let started_at = Utc::now();

        let run_result = session.transport.run(&command, step_deadline).await;
        crate::session::SessionRegistry::record_activity(&session);
        let finished_at = Utc::now();

        let (exit_code, stdout, stderr) = match run_result {
            Ok(cmd_result) => (
                cmd_result.exit_code,
                String::from_utf8_lossy(&cmd_result.stdout).to_string(),
                String::from_utf8_lossy(&cmd_result.stderr).to_string(),
            ),
            Err(e) => {
                // A transport-level `run` failure (as opposed to the remote
                // command merely exiting non-zero) degrades the session per
                // spec §4.2: the next failed heartbeat closes it.
                crate::session::SessionRegistry::mark_degraded(&session);
                (-1, String::new(), e.to_string())
            }
        };

        let succeeded = exit_code == 0;
        let result = StepResult {
            exit_code,
            stdout,
            stderr,
            duration: (finished_at - started_at).to_std().unwrap_or(Duration::ZERO),
            started_at,
            finished_at,
        };

        plan.steps[step_index].state = if succeeded { StepState::Succeeded } else { StepState::Failed };
        plan.steps[step_index].result = Some(result);

        self.audit.record(
            AuditRecord::new(
                user_id,
                AuditAction::StepResult,
                if succeeded { AuditOutcome::Ok } else { AuditOutcome::Failed },
                format!("exit_code={exit_code}"),
            )
            .with_session(session_id)
            .with_plan(plan_id)
            .with_step(step_index),
        );

        if !succeeded {
            self.skip_remaining(plan, step_index);
        }

        self.resolve_if_done(plan).await;
        Ok(())
    }

    fn resolve_step_deadline(&self, hint_secs: Option<u64>) -> Duration {
        let default = self.limits.step_deadline_secs;
        let bounded = hint_secs.unwrap_or(default).clamp(MIN_STEP_DEADLINE_SECS, MAX_STEP_DEADLINE_SECS);
        Duration::from_secs(bounded)
    }

    fn skip_remaining(&self, plan: &mut Plan, from_index: usize) {
        let plan_id = plan.plan_id;
        let user_id = plan.user_id.clone();
        let session_id = plan.session_id;

        for step in plan.steps.iter_mut().skip(from_index + 1) {
            if step.state == StepState::Pending {
                step.state = StepState::Skipped;
                self.audit.record(
                    AuditRecord::new(&user_id, AuditAction::StepSkipped, AuditOutcome::Ok, "preceding-step-failed")
                        .with_session(session_id)
                        .with_plan(plan_id)
                        .with_step(step.index),
                );
            }
        }
    }

    async fn resolve_if_done(&self, plan: &mut Plan) {
        if !plan.is_resolved() {
            return;
        }
        let outcome = if plan.resolved_successfully() { AuditOutcome::Ok } else { AuditOutcome::Failed };
        self.audit.record(
            AuditRecord::new(&plan.user_id, AuditAction::PlanResolved, outcome, "")
                .with_session(plan.session_id)
                .with_plan(plan.plan_id),
        );
    }

    async fn clear_active_if_resolved(&self, plan_id: Uuid, session_id: Option<Uuid>) {
        if let Some(session_id) = session_id {
            let mut active = self.active_plan_by_session.write().await;
            if active.get(&session_id) == Some(&plan_id) {
                active.remove(&session_id);
            }
        }
    }
}
