// src/errors.rs
//! Closed error taxonomy (spec §7).
//!
//! Every subsystem gets its own `thiserror` enum; `CoreError` composes them
//! for callers (the CLI binary) that need one `Result` type across all of
//! the core's operations. Library code never downcasts to `anyhow`; that
//! conversion only happens at the binary boundary in `main.rs`/`cli.rs`.

use thiserror::Error;

/// Credential Vault (C1) failures.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("sealed credential blob failed authentication (tampered or corrupt)")]
    Integrity,
    #[error("malformed sealed blob: {0}")]
    Malformed(String),
    #[error("credential payload could not be serialized: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// SSH Transport (C2) failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("authentication failed for {username}@{host}: {reason}")]
    AuthFailure {
        host: String,
        username: String,
        reason: String,
    },
    #[error("session closed")]
    SessionClosed,
    #[error("command deadline exceeded")]
    DeadlineExceeded,
    #[error("channel I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// A sealed credential that fails its integrity check can never yield
    /// usable auth material, so it surfaces the same way any other
    /// rejected credential would (spec §8 scenario S6): `AuthFailure`, not
    /// a separate crypto-flavored variant leaking into the transport layer.
    pub fn from_vault_error(host: &str, username: &str, err: VaultError) -> Self {
        TransportError::AuthFailure {
            host: host.to_string(),
            username: username.to_string(),
            reason: format!("sealed credential rejected: {err}"),
        }
    }
}

/// Generation (C5) failures.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("model call exceeded its deadline")]
    ModelTimeout,
    #[error("model refused the request: {explanation}")]
    ModelRefusal { explanation: String },
    #[error("could not parse model output as JSON near byte {position}: {context}")]
    ParseFailure { position: usize, context: String },
    #[error("generated plan failed schema validation: missing {missing:?}")]
    ValidationFailure { missing: Vec<String> },
}

/// Orchestration (C6) / Session Registry (C4) failures.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("plan {0} not found")]
    PlanNotFound(String),
    #[error("step index {requested} is out of order; next eligible step is {expected}")]
    OutOfOrder { requested: usize, expected: usize },
    #[error("step {0} cannot transition from its current state")]
    InvalidTransition(usize),
    #[error("session is not connected; step cannot execute")]
    SessionUnavailable,
    #[error("a plan is already in flight for this session")]
    SessionBusy,
    #[error("connect error: {0}")]
    Connect(#[from] TransportError),
}

/// Crate-level error uniting every subsystem, used at the CLI boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG directory error: {0}")]
    Xdg(#[from] xdg::BaseDirectoriesError),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
