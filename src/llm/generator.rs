// src/llm/generator.rs
//! Prompt construction and the semantic half of validation (spec §4.5.2,
//! §4.5.3 steps 7-9, §4.5.4): schema checking, risk normalization, and
//! plan-level risk recomputation over the `Value` the recovery pipeline
//! produces.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::errors::GenerationError;
use crate::plan::{Risk, Step};
use crate::profiler::HostProfile;

use super::provider::PlanGenerator;
use super::recovery::recover_and_parse;

const SAFETY_CONSTRAINTS: &str = "\
Operations must be idempotent where possible. Never replace or recompile the kernel. \
Never flush firewall rules without an equivalent `ufw reload`/`iptables-restore` step that \
re-applies the existing ruleset. Never run `rm -rf /` or any command that deletes the root \
filesystem. Never modify the SSH listener configuration or restart the SSH daemon in a way that \
could lock out the current session.";

/// Fields the generator produces before identity/bookkeeping fields
/// (`plan_id`, `session_id`, `user_id`, `created_at`) are attached by the
/// orchestrator.
pub struct GeneratedPlan {
    pub intent: String,
    pub action: String,
    pub explanation: String,
    pub overall_risk: Risk,
    pub steps: Vec<Step>,
}

pub struct PlanGeneratorPipeline {
    generator: Arc<dyn PlanGenerator>,
}

impl PlanGeneratorPipeline {
    pub fn new(generator: Arc<dyn PlanGenerator>) -> Self {
        PlanGeneratorPipeline { generator }
    }

    pub async fn generate(
        &self,
        request_text: &str,
        profile: &HostProfile,
        deadline: Duration,
    ) -> Result<GeneratedPlan, GenerationError> {
        let system_prompt = build_system_prompt(profile);

        let raw = tokio::time::timeout(deadline, self.generator.generate(&system_prompt, request_text, deadline))
            .await
            .map_err(|_| GenerationError::ModelTimeout)??;

        let value = recover_and_parse(&raw)?;
        validate_and_build(value)
    }
}

fn build_system_prompt(profile: &HostProfile) -> String {
    format!(
        "You are an infrastructure automation planner for a single target host.\n\n\
         Target host profile:\n\
         - OS family: {:?}\n\
         - Distribution: {}\n\
         - Version: {}\n\
         - Kernel: {}\n\
         - Architecture: {}\n\
         - Memory total: {} bytes\n\
         - Disk free: {} bytes\n\
         - Tools on PATH: {:?}\n\
         - Service manager: {:?}\n\n\
         Emit exactly one JSON object with this closed vocabulary and nothing else — no prose, \
         no markdown code fences, no trailing commas:\n\
         {{\"intent\": string, \"action\": string, \"risk_level\": \"low\"|\"medium\"|\"high\"|\"critical\", \
         \"explanation\": string, \"steps\": [{{\"step\": integer (1-based), \"command\": string, \
         \"explanation\": string, \"risk_level\": string, \"estimated_time\": integer seconds}}]}}\n\n\
         {SAFETY_CONSTRAINTS}\n\n\
         OS-family hints: debian-family hosts use `apt-get`; rhel-family hosts use `dnf` or `yum`. \
         Prefer explicit non-interactive flags (e.g. `-y`).",
        profile.os_family,
        profile.distribution,
        profile.version,
        profile.kernel,
        profile.arch,
        profile.memory_total_bytes,
        profile.disk_free_bytes,
        profile.tools,
        profile.service_manager,
    )
}

fn validate_and_build(value: Value) -> Result<GeneratedPlan, GenerationError> {
    let mut missing = Vec::new();

    let intent = value.get("intent").and_then(Value::as_str);
    if intent.is_none() {
        missing.push("intent".to_string());
    }
    let action = value.get("action").and_then(Value::as_str);
    if action.is_none() {
        missing.push("action".to_string());
    }
    let explanation = value.get("explanation").and_then(Value::as_str);
    if explanation.is_none() {
        missing.push("explanation".to_string());
    }
    let declared_risk = value.get("risk_level").and_then(Value::as_str);
    let raw_steps = value.get("steps").and_then(Value::as_array);
    if raw_steps.is_none() {
        missing.push("steps".to_string());
    }

    if !missing.is_empty() {
        return Err(GenerationError::ValidationFailure { missing });
    }

    let raw_steps = raw_steps.unwrap();

    if raw_steps.is_empty() {
        if let Some(explanation) = explanation.filter(|e| !e.trim().is_empty()) {
            return Err(GenerationError::ModelRefusal {
                explanation: explanation.to_string(),
            });
        }
        return Err(GenerationError::ValidationFailure {
            missing: vec!["steps".to_string()],
        });
    }

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (position, raw_step) in raw_steps.iter().enumerate() {
        let step_number = raw_step.get("step").and_then(Value::as_u64);
        let command = raw_step.get("command").and_then(Value::as_str).unwrap_or("");

        if command.trim().is_empty() {
            return Err(GenerationError::ValidationFailure {
                missing: vec![format!("steps[{position}].command")],
            });
        }
        if step_number != Some((position + 1) as u64) {
            return Err(GenerationError::ValidationFailure {
                missing: vec![format!("steps[{position}].step (expected {})", position + 1)],
            });
        }

        let step_explanation = raw_step.get("explanation").and_then(Value::as_str).unwrap_or("").to_string();
        let estimated_time = raw_step.get("estimated_time").and_then(Value::as_u64);
        let step_risk_raw = raw_step.get("risk_level").and_then(Value::as_str);
        let risk = normalize_risk(step_risk_raw, position);

        steps.push(Step::new(position, command.to_string(), step_explanation, estimated_time, risk));
    }

    let declared_overall = normalize_risk(declared_risk, usize::MAX);
    let computed_overall = steps.iter().map(|s| s.risk).max().unwrap_or(Risk::Low);
    if declared_overall != computed_overall {
        warn!(
            declared = ?declared_overall,
            computed = ?computed_overall,
            "model-declared overall risk disagrees with computed risk; computed value wins"
        );
    }

    Ok(GeneratedPlan {
        intent: intent.unwrap().to_string(),
        action: action.unwrap().to_string(),
        explanation: explanation.unwrap().to_string(),
        overall_risk: computed_overall,
        steps,
    })
}

fn normalize_risk(raw: Option<&str>, step_position: usize) -> Risk {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("low") => Risk::Low,
        Some("medium") => Risk::Medium,
        Some("high") => Risk::High,
        Some("critical") => Risk::Critical,
        other => {
            if step_position != usize::MAX {
                warn!(step = step_position, value = ?other, "coercing unrecognized risk level to medium");
            }
            Risk::Medium
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_well_formed_plan() {
        let value = json!({
            "intent": "install nginx",
            "action": "install_and_start",
            "explanation": "installs and starts nginx",
            "risk_level": "low",
            "steps": [
                {"step": 1, "command": "apt-get update", "explanation": "refresh package index", "risk_level": "low", "estimated_time": 30},
                {"step": 2, "command": "apt-get install -y nginx", "explanation": "install nginx", "risk_level": "medium", "estimated_time": 60}
            ]
        });
        let plan = validate_and_build(value).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.overall_risk, Risk::Medium);
    }

    #[test]
    fn rejects_empty_steps_as_validation_failure_without_explanation() {
        let value = json!({"intent": "x", "action": "y", "explanation": "", "risk_level": "low", "steps": []});
        let err = validate_and_build(value);
        assert!(matches!(err, Err(GenerationError::ValidationFailure { .. })));
    }

    #[test]
    fn treats_empty_steps_with_explanation_as_model_refusal() {
        let value = json!({"intent": "x", "action": "y", "explanation": "cannot safely do this", "risk_level": "low", "steps": []});
        let err = validate_and_build(value);
        assert!(matches!(err, Err(GenerationError::ModelRefusal { .. })));
    }

    #[test]
    fn coerces_unrecognized_step_risk_to_medium() {
        let value = json!({
            "intent": "x", "action": "y", "explanation": "z", "risk_level": "low",
            "steps": [{"step": 1, "command": "echo hi", "explanation": "", "risk_level": "bogus", "estimated_time": 1}]
        });
        let plan = validate_and_build(value).unwrap();
        assert_eq!(plan.steps[0].risk, Risk::Medium);
    }

    #[test]
    fn rejects_step_index_mismatch() {
        let value = json!({
            "intent": "x", "action": "y", "explanation": "z", "risk_level": "low",
            "steps": [{"step": 2, "command": "echo hi", "explanation": "", "risk_level": "low", "estimated_time": 1}]
        });
        let err = validate_and_build(value);
        assert!(matches!(err, Err(GenerationError::ValidationFailure { .. })));
    }
}
