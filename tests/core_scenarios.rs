//! End-to-end scenarios from spec.md §8 (S1-S5), driven against an
//! in-memory fake transport and a scripted `PlanGenerator` — no real
//! network or process I/O (SPEC_FULL §10.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hostpilot::audit::AuditAction;
use hostpilot::config::LimitsConfig;
use hostpilot::errors::{GenerationError, OrchestratorError, TransportError};
use hostpilot::llm::{PlanGenerator, PlanGeneratorPipeline};
use hostpilot::plan::{PlanOrchestrator, StepState};
use hostpilot::profiler::HostProfile;
use hostpilot::session::SessionRegistry;
use hostpilot::ssh::{CommandResult, CommandRunner};
use hostpilot::{CoreError, InMemoryAuditSink};

/// An in-memory stand-in for a live SSH channel. Commands not explicitly
/// scripted fail closed (exit 1, empty output) so host-profiling probes —
/// which this fake never bothers to script — degrade the way a real
/// best-effort probe battery would.
struct FakeTransport {
    scripted: Mutex<HashMap<String, CommandResult>>,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new() -> Self {
        FakeTransport { scripted: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    fn script(self, command: &str, exit_code: i32) -> Self {
        self.scripted.lock().unwrap().insert(
            command.to_string(),
            CommandResult { exit_code, stdout: Vec::new(), stderr: Vec::new(), duration: Duration::ZERO },
        );
        self
    }
}

#[async_trait]
impl CommandRunner for FakeTransport {
    async fn run(&self, command: &str, _deadline: Duration) -> Result<CommandResult, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionClosed);
        }
        match self.scripted.lock().unwrap().get(command) {
            Some(result) => Ok(result.clone()),
            None => Ok(CommandResult { exit_code: 1, stdout: Vec::new(), stderr: Vec::new(), duration: Duration::ZERO }),
        }
    }

    async fn heartbeat(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A `PlanGenerator` that returns one canned raw response, ignoring the
/// prompts entirely — the recovery/validation pipeline in `llm::generator`
/// is exercised for real against whatever text is scripted here.
struct ScriptedGenerator {
    raw: String,
}

#[async_trait]
impl PlanGenerator for ScriptedGenerator {
    async fn generate(&self, _system: &str, _user: &str, _deadline: Duration) -> Result<String, GenerationError> {
        Ok(self.raw.clone())
    }
}

fn orchestrator_with(raw_response: &str) -> (Arc<SessionRegistry>, PlanOrchestrator, Arc<InMemoryAuditSink>) {
    let limits = LimitsConfig::default();
    let audit = Arc::new(InMemoryAuditSink::new());
    let sessions = SessionRegistry::spawn(limits.clone(), audit.clone());
    let generator: Arc<dyn PlanGenerator> = Arc::new(ScriptedGenerator { raw: raw_response.to_string() });
    let orchestrator = PlanOrchestrator::new(
        sessions.clone(),
        PlanGeneratorPipeline::new(generator),
        audit.clone(),
        limits,
    );
    (sessions, orchestrator, audit)
}

const HAPPY_PATH_PLAN: &str = r#"{
  "intent": "install and start nginx",
  "action": "install_and_start_nginx",
  "explanation": "installs nginx and enables it at boot",
  "risk_level": "medium",
  "steps": [
    {"step": 1, "command": "apt-get update", "explanation": "refresh package index", "risk_level": "low", "estimated_time": 30},
    {"step": 2, "command": "apt-get install -y nginx", "explanation": "install nginx", "risk_level": "medium", "estimated_time": 60},
    {"step": 3, "command": "systemctl enable --now nginx", "explanation": "enable and start nginx", "risk_level": "medium", "estimated_time": 10},
    {"step": 4, "command": "systemctl status nginx --no-pager", "explanation": "verify nginx is running", "risk_level": "low", "estimated_time": 5}
  ]
}"#;

/// S1: happy path — every step approved and succeeds in order.
#[tokio::test]
async fn s1_happy_path_resolves_successfully() {
    let (sessions, orchestrator, audit) = orchestrator_with(HAPPY_PATH_PLAN);

    let transport = FakeTransport::new()
        .script("apt-get update", 0)
        .script("apt-get install -y nginx", 0)
        .script("systemctl enable --now nginx", 0)
        .script("systemctl status nginx --no-pager", 0);
    let session_id = sessions
        .connect_with_runner("alice", "db1.internal", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("alice", session_id, "install nginx and start it").await.unwrap();
    assert_eq!(plan.steps.len(), 4);

    for i in 0..4 {
        let outcome = orchestrator.respond("alice", plan.plan_id, i, true, None).await.unwrap();
        assert_eq!(outcome.state, StepState::Succeeded);
    }

    let resolved = orchestrator.get("alice", plan.plan_id).await.unwrap();
    assert!(resolved.is_resolved());
    assert!(resolved.resolved_successfully());

    let records = audit.records();
    let step_results = records.iter().filter(|r| r.action == AuditAction::StepResult).count();
    assert_eq!(step_results, 4);
    assert_eq!(records.iter().filter(|r| r.action == AuditAction::PlanResolved).count(), 1);
}

/// S2: noisy model output — markdown fence, a line comment, a trailing
/// comma, and an embedded literal newline inside a command string all
/// survive the recovery pipeline.
#[tokio::test]
async fn s2_noisy_model_output_is_recovered() {
    let noisy = "```json\n{\n  \"intent\": \"patch system\",\n  \"action\": \"apt_upgrade\", // planner note\n  \"explanation\": \"applies pending security updates\",\n  \"risk_level\": \"medium\",\n  \"steps\": [\n    {\"step\": 1, \"command\": \"apt-get update && apt-get -y upgrade\", \"explanation\": \"line one\\nline two\", \"risk_level\": \"medium\", \"estimated_time\": 120,},\n  ]\n}\n```";
    let (sessions, orchestrator, _audit) = orchestrator_with(noisy);

    let transport = FakeTransport::new().script("apt-get update && apt-get -y upgrade", 0);
    let session_id = sessions
        .connect_with_runner("bob", "web1.internal", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("bob", session_id, "patch the system").await.unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].command, "apt-get update && apt-get -y upgrade");
}

/// S3: out-of-order approval is rejected and leaves the plan untouched.
#[tokio::test]
async fn s3_out_of_order_approval_rejected() {
    let (sessions, orchestrator, _audit) = orchestrator_with(HAPPY_PATH_PLAN);
    let transport = FakeTransport::new();
    let session_id = sessions
        .connect_with_runner("carol", "app1.internal", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("carol", session_id, "install nginx and start it").await.unwrap();

    let err = orchestrator.respond("carol", plan.plan_id, 1, true, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::OutOfOrder { requested: 1, expected: 0 }));

    let unchanged = orchestrator.get("carol", plan.plan_id).await.unwrap();
    assert!(unchanged.steps.iter().all(|s| s.state == StepState::Pending));
}

const THREE_STEP_PLAN: &str = r#"{
  "intent": "roll out config change",
  "action": "rollout",
  "explanation": "applies a config change in three steps",
  "risk_level": "medium",
  "steps": [
    {"step": 1, "command": "step-one", "explanation": "", "risk_level": "low", "estimated_time": 5},
    {"step": 2, "command": "step-two", "explanation": "", "risk_level": "medium", "estimated_time": 5},
    {"step": 3, "command": "step-three", "explanation": "", "risk_level": "low", "estimated_time": 5}
  ]
}"#;

/// S4: a mid-plan failure cascades — the failing step becomes `failed`,
/// every remaining pending step is auto-`skipped`, and the plan resolves
/// as failed with the audit trail in causal order.
#[tokio::test]
async fn s4_mid_plan_failure_cascades() {
    let (sessions, orchestrator, audit) = orchestrator_with(THREE_STEP_PLAN);
    let transport = FakeTransport::new().script("step-one", 0).script("step-two", 2);
    let session_id = sessions
        .connect_with_runner("dave", "batch1.internal", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("dave", session_id, "roll out the config change").await.unwrap();

    let first = orchestrator.respond("dave", plan.plan_id, 0, true, None).await.unwrap();
    assert_eq!(first.state, StepState::Succeeded);

    let second = orchestrator.respond("dave", plan.plan_id, 1, true, None).await.unwrap();
    assert_eq!(second.state, StepState::Failed);
    assert_eq!(second.result.unwrap().exit_code, 2);

    let resolved = orchestrator.get("dave", plan.plan_id).await.unwrap();
    assert!(resolved.is_resolved());
    assert!(!resolved.resolved_successfully());
    assert_eq!(resolved.steps[2].state, StepState::Skipped);

    let actions: Vec<AuditAction> = audit.records().into_iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::SessionConnect,
            AuditAction::PlanSubmitted,
            AuditAction::StepApproved,
            AuditAction::StepExecuting,
            AuditAction::StepResult,
            AuditAction::StepApproved,
            AuditAction::StepExecuting,
            AuditAction::StepResult,
            AuditAction::StepSkipped,
            AuditAction::PlanResolved,
        ]
    );

    // A stale respond against the now-resolved plan is a no-op (spec §8
    // idempotence law), returning the current (already-terminal) state.
    let repeat = orchestrator.respond("dave", plan.plan_id, 2, false, None).await.unwrap();
    assert_eq!(repeat.state, StepState::Skipped);
}

/// S5: client departure mid-execution. The session is torn down between
/// approving step 0 and approving step 1; step 1 fails as session-
/// unavailable rather than leaving the plan stuck in `executing`.
#[tokio::test]
async fn s5_client_departure_fails_in_flight_step() {
    let (sessions, orchestrator, _audit) = orchestrator_with(THREE_STEP_PLAN);
    let transport = FakeTransport::new().script("step-one", 0);
    let session_id = sessions
        .connect_with_runner("erin", "host1.internal", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("erin", session_id, "roll out the config change").await.unwrap();
    let first = orchestrator.respond("erin", plan.plan_id, 0, true, None).await.unwrap();
    assert_eq!(first.state, StepState::Succeeded);

    // Simulate a beacon_leave firing between steps.
    sessions.terminate_user("erin").await;

    let second = orchestrator.respond("erin", plan.plan_id, 1, true, None).await.unwrap();
    assert_eq!(second.state, StepState::Failed);

    let resolved = orchestrator.get("erin", plan.plan_id).await.unwrap();
    assert!(resolved.is_resolved());
    assert!(!resolved.resolved_successfully());
    assert_eq!(resolved.steps[2].state, StepState::Skipped);
}

/// Repeated `terminate_user`/`beacon_leave` calls are idempotent.
#[tokio::test]
async fn repeated_terminate_user_is_idempotent() {
    let limits = LimitsConfig::default();
    let audit = Arc::new(InMemoryAuditSink::new());
    let sessions = SessionRegistry::spawn(limits, audit);

    sessions
        .connect_with_runner("frank", "host1", 22, "deploy", Arc::new(FakeTransport::new()))
        .await
        .unwrap();

    sessions.terminate_user("frank").await;
    sessions.terminate_user("frank").await;

    assert!(sessions.list("frank").await.is_empty());
}

/// `respond_all` drives every pending step in order and short-circuits on
/// the first failure, auto-skipping what remains.
#[tokio::test]
async fn respond_all_short_circuits_on_failure() {
    let (sessions, orchestrator, _audit) = orchestrator_with(THREE_STEP_PLAN);
    let transport = FakeTransport::new().script("step-one", 0).script("step-two", 1);
    let session_id = sessions
        .connect_with_runner("gina", "host2", 22, "deploy", Arc::new(transport))
        .await
        .unwrap();

    let plan = orchestrator.submit("gina", session_id, "roll out the config change").await.unwrap();
    let resolved = orchestrator.respond_all("gina", plan.plan_id, true).await.unwrap();

    assert_eq!(resolved.steps[0].state, StepState::Succeeded);
    assert_eq!(resolved.steps[1].state, StepState::Failed);
    assert_eq!(resolved.steps[2].state, StepState::Skipped);
}

/// A plan with zero steps from the generator is rejected as a validation
/// failure, never "resolved" as an empty success (spec §8 boundary case).
#[tokio::test]
async fn empty_steps_is_a_validation_failure_not_empty_success() {
    let empty = r#"{"intent": "x", "action": "y", "risk_level": "low", "steps": []}"#;
    let (sessions, orchestrator, _audit) = orchestrator_with(empty);
    let session_id = sessions
        .connect_with_runner("hank", "host3", 22, "deploy", Arc::new(FakeTransport::new()))
        .await
        .unwrap();

    let err = orchestrator.submit("hank", session_id, "do nothing useful").await.unwrap_err();
    assert!(matches!(err, CoreError::Generation(GenerationError::ValidationFailure { .. })));
}

/// A second `submit` against the same session while a plan is still
/// unresolved is rejected with `SessionBusy`.
#[tokio::test]
async fn second_submit_against_busy_session_is_rejected() {
    let (sessions, orchestrator, _audit) = orchestrator_with(THREE_STEP_PLAN);
    let session_id = sessions
        .connect_with_runner("ivy", "host4", 22, "deploy", Arc::new(FakeTransport::new()))
        .await
        .unwrap();

    let _plan = orchestrator.submit("ivy", session_id, "roll out the config change").await.unwrap();
    let err = orchestrator.submit("ivy", session_id, "roll out again").await.unwrap_err();
    assert!(matches!(err, CoreError::Orchestrator(OrchestratorError::SessionBusy)));
}

/// A stub `HostProfile` is reachable from the public API surface the way
/// the orchestrator's prompt-construction step consumes it.
#[test]
fn host_profile_type_is_public() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<HostProfile>();
}
