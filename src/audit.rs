// src/audit.rs
//! Audit sink (spec §3 AuditRecord, §7 vocabulary).
//!
//! Consolidates the teacher's `audit.rs`/`audit_engine.rs` pair — both
//! carried an open-ended `AuditEventType` enum spanning VM/MCP/policy
//! concerns well outside this core — into one closed vocabulary and an
//! `AuditSink` trait so the orchestrator and registry can emit against an
//! opaque collaborator, with the teacher's JSONL file writer kept as the
//! one concrete implementation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

/// Closed action vocabulary (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "session.connect")]
    SessionConnect,
    #[serde(rename = "session.disconnect")]
    SessionDisconnect,
    #[serde(rename = "session.heartbeat_failed")]
    SessionHeartbeatFailed,
    #[serde(rename = "session.evicted")]
    SessionEvicted,
    #[serde(rename = "plan.submitted")]
    PlanSubmitted,
    #[serde(rename = "plan.generation_failed")]
    PlanGenerationFailed,
    #[serde(rename = "step.approved")]
    StepApproved,
    #[serde(rename = "step.rejected")]
    StepRejected,
    #[serde(rename = "step.executing")]
    StepExecuting,
    #[serde(rename = "step.result")]
    StepResult,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "plan.resolved")]
    PlanResolved,
    #[serde(rename = "chat.message")]
    ChatMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Ok,
    Failed,
    Degraded,
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub session_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub step_index: Option<usize>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(
        user_id: impl Into<String>,
        action: AuditAction,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) -> Self {
        AuditRecord {
            timestamp: Utc::now(),
            user_id: user_id.into(),
            session_id: None,
            plan_id: None,
            step_index: None,
            action,
            outcome,
            detail: detail.into(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

/// An opaque, append-only collaborator. Implementations must be safe for
/// concurrent emitters; the core never reads records back.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes one JSON object per line to a file, matching the teacher's
/// `audit_ledger.jsonl` convention.
pub struct JsonlAuditSink {
    writer: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlAuditSink {
            writer: Mutex::new(file),
        })
    }

    pub fn default_path() -> PathBuf {
        xdg::BaseDirectories::with_prefix(crate::config::APP_NAME)
            .ok()
            .map(|dirs| dirs.get_data_home().join("audit").join("audit_ledger.jsonl"))
            .unwrap_or_else(|| PathBuf::from("audit_ledger.jsonl"))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) {
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize audit record: {e}");
                return;
            }
        };
        line.push('\n');

        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.flush()) {
            error!("failed to write audit record: {e}");
        }
    }
}

/// In-memory sink for tests and for local CLI smoke-testing without a
/// filesystem dependency.
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        InMemoryAuditSink::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_preserves_emission_order() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditRecord::new("alice", AuditAction::SessionConnect, AuditOutcome::Ok, "connected"));
        sink.record(AuditRecord::new("alice", AuditAction::SessionDisconnect, AuditOutcome::Ok, "disconnected"));
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, AuditAction::SessionConnect);
        assert_eq!(records[1].action, AuditAction::SessionDisconnect);
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("hostpilot-audit-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.jsonl");
        let sink = JsonlAuditSink::create(&path).unwrap();
        sink.record(AuditRecord::new("bob", AuditAction::PlanSubmitted, AuditOutcome::Ok, "submitted"));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("plan.submitted"));
        fs::remove_dir_all(&dir).ok();
    }
}
