// src/session/registry.rs
//! Per-user map of live SSH sessions, generalized from the teacher's
//! `session_manager.rs` (which tracked VM/tmux workspace lifecycle) into a
//! registry of live [`SshTransport`] handles with heartbeat and idle
//! eviction, the way the teacher's `SessionManager` tracked VM sessions but
//! for a live network resource instead of a local process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use crate::config::LimitsConfig;
use crate::errors::{OrchestratorError, TransportError};
use crate::profiler::{self, HostProfile};
use crate::ssh::{CommandRunner, SshTransport};
use crate::vault::CredentialMaterial;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl SessionStatus {
    fn to_tag(self) -> u8 {
        match self {
            SessionStatus::Connecting => 0,
            SessionStatus::Connected => 1,
            SessionStatus::Degraded => 2,
            SessionStatus::Closed => 3,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Connected,
            2 => SessionStatus::Degraded,
            _ => SessionStatus::Closed,
        }
    }
}

/// A live session owned by the registry (spec §3). `status` and
/// `last_activity_at`/`last_heartbeat_at` are atomics so the happy-path
/// `run` call never takes the registry's map lock.
pub struct Session {
    pub user_id: String,
    pub session_id: Uuid,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub transport: Arc<dyn CommandRunner>,
    pub created_at: DateTime<Utc>,
    status: AtomicU8,
    last_activity_at: AtomicI64,
    last_heartbeat_at: AtomicI64,
    consecutive_heartbeat_failures: AtomicU32,
    cached_profile: tokio::sync::RwLock<Option<HostProfile>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_tag(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status.to_tag(), Ordering::Release);
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        epoch_to_datetime(self.last_activity_at.load(Ordering::Acquire))
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        epoch_to_datetime(self.last_heartbeat_at.load(Ordering::Acquire))
    }

    fn touch_activity(&self) {
        self.last_activity_at.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Returns the cached profile, profiling the live transport once and
    /// memoizing the result if none is cached yet (spec §4.3).
    pub async fn host_profile(&self) -> HostProfile {
        {
            let cached = self.cached_profile.read().await;
            if let Some(profile) = cached.as_ref() {
                return profile.clone();
            }
        }
        let profile = profiler::profile(&self.transport).await;
        let mut cached = self.cached_profile.write().await;
        *cached = Some(profile.clone());
        profile
    }
}

type UserSessions = HashMap<Uuid, Arc<Session>>;

/// Thread-safe per-user map of sessions, plus the background heartbeat and
/// idle-eviction scheduler (spec §4.4, §5).
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, UserSessions>>,
    limits: LimitsConfig,
    audit: Arc<dyn AuditSink>,
}

impl SessionRegistry {
    /// Builds the registry and spawns its background scheduler. The
    /// scheduler holds only a `Weak` reference, so it exits once every
    /// strong reference to the registry is dropped.
    pub fn spawn(limits: LimitsConfig, audit: Arc<dyn AuditSink>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            limits,
            audit,
        });

        let weak: Weak<SessionRegistry> = Arc::downgrade(&registry);
        let interval = Duration::from_secs(registry.limits.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(registry) => registry.run_scheduler_pass().await,
                    None => break,
                }
            }
        });

        registry
    }

    async fn run_scheduler_pass(&self) {
        let idle_timeout = Duration::from_secs(self.limits.idle_timeout_secs);
        let snapshot: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().flat_map(|m| m.values().cloned()).collect()
        };

        for session in snapshot {
            if session.status() == SessionStatus::Closed {
                continue;
            }

            let idle_for = Utc::now().signed_duration_since(session.last_activity_at());
            if idle_for.to_std().unwrap_or(Duration::ZERO) > idle_timeout {
                info!(user_id = %session.user_id, session_id = %session.session_id, "evicting idle session");
                self.close_session(&session, "idle timeout exceeded").await;
                self.audit.record(
                    AuditRecord::new(session.user_id.clone(), AuditAction::SessionEvicted, AuditOutcome::Ok, "idle timeout")
                        .with_session(session.session_id),
                );
                continue;
            }

            let alive = session.transport.heartbeat().await;
            session.last_heartbeat_at.store(Utc::now().timestamp_millis(), Ordering::Release);

            if alive {
                session.consecutive_heartbeat_failures.store(0, Ordering::Release);
                if session.status() == SessionStatus::Degraded {
                    session.set_status(SessionStatus::Connected);
                }
                continue;
            }

            let failures = session.consecutive_heartbeat_failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(user_id = %session.user_id, session_id = %session.session_id, failures, "heartbeat failed");
            self.audit.record(
                AuditRecord::new(session.user_id.clone(), AuditAction::SessionHeartbeatFailed, AuditOutcome::Degraded, "heartbeat probe failed")
                    .with_session(session.session_id),
            );

            if failures >= 2 {
                info!(user_id = %session.user_id, session_id = %session.session_id, "two consecutive heartbeat failures; closing session");
                self.close_session(&session, "two consecutive heartbeat failures").await;
                self.audit.record(
                    AuditRecord::new(session.user_id.clone(), AuditAction::SessionEvicted, AuditOutcome::Ok, "heartbeat failure")
                        .with_session(session.session_id),
                );
            } else {
                session.set_status(SessionStatus::Degraded);
            }
        }
    }

    async fn close_session(&self, session: &Session, reason: &str) {
        session.transport.close().await;
        session.set_status(SessionStatus::Closed);
        let _ = reason;
    }

    /// Opens a transport via C2, stores the session, and returns its id.
    pub async fn connect(
        &self,
        user_id: &str,
        hostname: &str,
        port: u16,
        username: &str,
        credential: CredentialMaterial,
    ) -> Result<Uuid, TransportError> {
        self.check_session_cap(user_id, hostname, port).await?;

        let connect_deadline = Duration::from_secs(self.limits.connect_deadline_secs);
        let transport = SshTransport::open(
            hostname,
            port,
            username,
            &credential,
            connect_deadline,
            self.limits.max_output_bytes,
        )
        .await?;

        Ok(self.insert_session(user_id, hostname, port, username, Arc::new(transport)).await)
    }

    /// Reconnects from a credential already sealed at rest (spec §3
    /// `Session.sealed_credentials`), the path a restart-and-resume flow
    /// would use instead of `connect`'s raw credential. A tampered blob
    /// fails the vault's integrity check and surfaces as `AuthFailure`
    /// before any network I/O happens (spec §8 scenario S6) — no session
    /// is created and nothing is logged beyond the caller's own audit of
    /// the failed `connect`.
    pub async fn connect_with_sealed(
        &self,
        vault: &crate::vault::CredentialVault,
        user_id: &str,
        hostname: &str,
        port: u16,
        username: &str,
        sealed: crate::vault::SealedCredential,
    ) -> Result<Uuid, TransportError> {
        let credential = vault
            .unseal(&sealed)
            .map_err(|e| TransportError::from_vault_error(hostname, username, e))?;
        // `credential` is zeroized on drop regardless of which branch
        // `connect` returns through (see `CredentialMaterial`'s `Drop` impl).
        self.connect(user_id, hostname, port, username, credential).await
    }

    /// Registers an already-open transport as a connected session, skipping
    /// the real network handshake. Used by `connect` above and, directly,
    /// by tests that drive the registry with an in-memory fake
    /// [`CommandRunner`] instead of a live SSH connection.
    pub async fn connect_with_runner(
        &self,
        user_id: &str,
        hostname: &str,
        port: u16,
        username: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Uuid, TransportError> {
        self.check_session_cap(user_id, hostname, port).await?;
        Ok(self.insert_session(user_id, hostname, port, username, runner).await)
    }

    async fn check_session_cap(&self, user_id: &str, hostname: &str, port: u16) -> Result<(), TransportError> {
        let sessions = self.sessions.read().await;
        if let Some(user_sessions) = sessions.get(user_id) {
            if user_sessions.len() >= self.limits.max_sessions_per_user {
                return Err(TransportError::Connect {
                    host: hostname.to_string(),
                    port,
                    reason: format!(
                        "user already has the maximum of {} concurrent sessions",
                        self.limits.max_sessions_per_user
                    ),
                });
            }
        }
        Ok(())
    }

    async fn insert_session(
        &self,
        user_id: &str,
        hostname: &str,
        port: u16,
        username: &str,
        transport: Arc<dyn CommandRunner>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let session = Arc::new(Session {
            user_id: user_id.to_string(),
            session_id,
            hostname: hostname.to_string(),
            username: username.to_string(),
            port,
            transport,
            created_at: now,
            status: AtomicU8::new(SessionStatus::Connected.to_tag()),
            last_activity_at: AtomicI64::new(now.timestamp_millis()),
            last_heartbeat_at: AtomicI64::new(now.timestamp_millis()),
            consecutive_heartbeat_failures: AtomicU32::new(0),
            cached_profile: tokio::sync::RwLock::new(None),
        });

        let mut sessions = self.sessions.write().await;
        sessions.entry(user_id.to_string()).or_default().insert(session_id, session);

        self.audit.record(
            AuditRecord::new(user_id, AuditAction::SessionConnect, AuditOutcome::Ok, format!("{username}@{hostname}:{port}"))
                .with_session(session_id),
        );

        session_id
    }

    /// Removes the session and closes its transport; idempotent.
    pub async fn disconnect(&self, user_id: &str, session_id: Uuid) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(user_id).and_then(|m| m.remove(&session_id))
        };

        if let Some(session) = removed {
            session.transport.close().await;
            session.set_status(SessionStatus::Closed);
            self.audit.record(
                AuditRecord::new(user_id, AuditAction::SessionDisconnect, AuditOutcome::Ok, "disconnected")
                    .with_session(session_id),
            );
        }
    }

    pub async fn lookup(&self, user_id: &str, session_id: Uuid) -> Result<Arc<Session>, OrchestratorError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(user_id)
            .and_then(|m| m.get(&session_id))
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list(&self, user_id: &str) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(user_id).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// Disconnects every session for a user; invoked on client-departure
    /// beacon (spec §6 `beacon_leave`). Repeated calls terminate the same
    /// (now-empty) set exactly once.
    pub async fn terminate_user(&self, user_id: &str) {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(user_id).map(|m| m.into_values().collect()).unwrap_or_default()
        };

        for session in removed {
            session.transport.close().await;
            session.set_status(SessionStatus::Closed);
            self.audit.record(
                AuditRecord::new(user_id, AuditAction::SessionDisconnect, AuditOutcome::Ok, "beacon_leave")
                    .with_session(session.session_id),
            );
        }
    }

    /// Marks activity on a session after a successful `run` call (spec
    /// §8 invariant 4: `last_activity_at` strictly increases).
    pub fn record_activity(session: &Session) {
        session.touch_activity();
    }

    /// Marks a session `degraded` after a mid-session `run` failure (spec
    /// §4.2: "Mid-session `run` failure marks the session `degraded`; the
    /// next failed heartbeat transitions it to `closed`"). A no-op if the
    /// session is already `closed` — closure is terminal and must not be
    /// un-done by a stale in-flight failure.
    pub fn mark_degraded(session: &Session) {
        if session.status() != SessionStatus::Closed {
            session.set_status(SessionStatus::Degraded);
        }
    }
}

fn epoch_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tag_round_trips() {
        for status in [
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Degraded,
            SessionStatus::Closed,
        ] {
            assert_eq!(SessionStatus::from_tag(status.to_tag()), status);
        }
    }

    #[tokio::test]
    async fn tampered_sealed_credential_surfaces_as_auth_failure() {
        use crate::audit::InMemoryAuditSink;
        use crate::config::VaultConfig;
        use crate::vault::CredentialVault;

        let vault = CredentialVault::new(&VaultConfig { key_hex: None }).unwrap();
        let mut sealed = vault
            .seal(&CredentialMaterial::Password("hunter2".to_string()))
            .unwrap();
        sealed.tamper();

        let limits = LimitsConfig::default();
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::new());
        let registry = SessionRegistry::spawn(limits, audit.clone());

        let err = registry
            .connect_with_sealed(&vault, "mallory", "host1", 22, "deploy", sealed)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AuthFailure { .. }));
        assert!(registry.list("mallory").await.is_empty());
    }

    struct NoopRunner;

    #[async_trait::async_trait]
    impl CommandRunner for NoopRunner {
        async fn run(&self, _command: &str, _deadline: Duration) -> Result<crate::ssh::CommandResult, TransportError> {
            Ok(crate::ssh::CommandResult {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration: Duration::ZERO,
            })
        }
        async fn heartbeat(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn record_activity_strictly_increases_last_activity_at() {
        let limits = LimitsConfig::default();
        let audit: Arc<dyn AuditSink> = Arc::new(crate::audit::InMemoryAuditSink::new());
        let registry = SessionRegistry::spawn(limits, audit);

        let session_id = registry
            .connect_with_runner("dana", "host1", 22, "deploy", Arc::new(NoopRunner))
            .await
            .unwrap();
        let session = registry.lookup("dana", session_id).await.unwrap();

        let before = session.last_activity_at();
        SessionRegistry::record_activity(&session);
        let after = session.last_activity_at();
        assert!(after >= before);

        let before_ms = before.timestamp_millis();
        tokio::time::sleep(Duration::from_millis(2)).await;
        SessionRegistry::record_activity(&session);
        assert!(session.last_activity_at().timestamp_millis() > before_ms);
    }
}
