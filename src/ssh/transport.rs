// src/ssh/transport.rs
//! One authenticated shell channel per [`crate::session::Session`], plus the
//! primitive `run` operation (spec §4.2).
//!
//! Generalized from the teacher's static `ssh_manager.rs` (which only
//! parsed an `ssh.toml` table of host entries) into a live connection
//! manager: `open` performs the TCP connect, key exchange, and
//! authentication that the teacher left for the system `ssh` binary to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::vault::CredentialMaterial;

/// Result of one `run` call (spec §4.2). `exit_code = -1` with a filled
/// `stderr` is reserved for client-side failures (timeout, channel loss).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl CommandResult {
    pub(crate) fn client_failure(reason: &str) -> Self {
        CommandResult {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: reason.as_bytes().to_vec(),
            duration: Duration::ZERO,
        }
    }
}

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // Host-key pinning/verification is an adapter/deployment concern
        // (credential supply, known_hosts management) outside this core's
        // scope; the core only needs a live authenticated channel.
        Ok(true)
    }
}

const TRUNCATION_MARKER: &[u8] = b"\n...[truncated]";

/// Object-safe seam over "one live shell channel" (spec §4.2's `run`/
/// `heartbeat`/`close` primitives), so the Session Registry and Host
/// Profiler can be driven by an in-memory fake in tests instead of a real
/// network connection (SPEC_FULL §10.4).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, deadline: Duration) -> Result<CommandResult, TransportError>;
    async fn heartbeat(&self) -> bool;
    async fn close(&self);
}

/// One live authenticated shell channel to a single host.
pub struct SshTransport {
    handle: Mutex<Handle<AcceptAllHostKeys>>,
    host: String,
    port: u16,
    username: String,
    max_output_bytes: usize,
}

impl SshTransport {
    /// Performs TCP connect, protocol negotiation, and authentication.
    /// Authentication supports password or private-key material,
    /// disambiguated by the [`CredentialMaterial`] variant.
    pub async fn open(
        hostname: &str,
        port: u16,
        username: &str,
        credential: &CredentialMaterial,
        connect_deadline: Duration,
        max_output_bytes: usize,
    ) -> Result<Self, TransportError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(connect_deadline),
            ..Default::default()
        });

        let mut handle = timeout(
            connect_deadline,
            client::connect(config, (hostname, port), AcceptAllHostKeys),
        )
        .await
        .map_err(|_| TransportError::Connect {
            host: hostname.to_string(),
            port,
            reason: "connect deadline exceeded".to_string(),
        })?
        .map_err(|e| TransportError::Connect {
            host: hostname.to_string(),
            port,
            reason: e.to_string(),
        })?;

        let authenticated = match credential {
            CredentialMaterial::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| TransportError::AuthFailure {
                    host: hostname.to_string(),
                    username: username.to_string(),
                    reason: e.to_string(),
                })?,
            CredentialMaterial::PrivateKey { pem, passphrase } => {
                let key_pair = russh_keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| TransportError::AuthFailure {
                        host: hostname.to_string(),
                        username: username.to_string(),
                        reason: format!("invalid private key: {e}"),
                    })?;
                handle
                    .authenticate_publickey(username, Arc::new(key_pair))
                    .await
                    .map_err(|e| TransportError::AuthFailure {
                        host: hostname.to_string(),
                        username: username.to_string(),
                        reason: e.to_string(),
                    })?
            }
        };

        if !authenticated {
            return Err(TransportError::AuthFailure {
                host: hostname.to_string(),
                username: username.to_string(),
                reason: "credentials rejected".to_string(),
            });
        }

        Ok(SshTransport {
            handle: Mutex::new(handle),
            host: hostname.to_string(),
            port,
            username: username.to_string(),
            max_output_bytes,
        })
    }

    /// Executes one command, capturing stdout/stderr into independent
    /// byte buffers capped at `max_output_bytes`, with overflow replaced
    /// by a truncation marker.
    pub async fn run(&self, command: &str, deadline: Duration) -> Result<CommandResult, TransportError> {
        let start = std::time::Instant::now();
        let result = timeout(deadline, self.run_inner(command)).await;

        match result {
            Ok(Ok(mut cmd_result)) => {
                cmd_result.duration = start.elapsed();
                Ok(cmd_result)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(host = %self.host, "command deadline exceeded: {command}");
                Err(TransportError::DeadlineExceeded)
            }
        }
    }

    async fn run_inner(&self, command: &str) -> Result<CommandResult, TransportError> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1i32;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => append_capped(&mut stdout, &data, self.max_output_bytes),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    append_capped(&mut stderr, &data, self.max_output_bytes)
                }
                Some(ChannelMsg::ExtendedData { .. }) => {}
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status as i32;
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => break,
            }
        }

        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
            duration: Duration::ZERO,
        })
    }

    /// Issues a cheap, idempotent probe; returns false on any error.
    pub async fn heartbeat(&self) -> bool {
        match self.run("true", Duration::from_secs(10)).await {
            Ok(result) => result.exit_code == 0,
            Err(e) => {
                debug!(host = %self.host, "heartbeat failed: {e}");
                false
            }
        }
    }

    /// Best-effort teardown; safe to call multiple times.
    pub async fn close(&self) {
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

#[async_trait]
impl CommandRunner for SshTransport {
    async fn run(&self, command: &str, deadline: Duration) -> Result<CommandResult, TransportError> {
        SshTransport::run(self, command, deadline).await
    }

    async fn heartbeat(&self) -> bool {
        SshTransport::heartbeat(self).await
    }

    async fn close(&self) {
        SshTransport::close(self).await
    }
}

/// Appends `data` to `buf`, capping its content at `cap` bytes. Truncation
/// is tracked by the marker's own presence rather than by byte count alone,
/// so a buffer that lands on exactly `cap` bytes with no overflow yet still
/// gets the marker the moment any further data would be dropped — the
/// marker is appended at most once per buffer.
fn append_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    if data.is_empty() || buf.ends_with(TRUNCATION_MARKER) {
        return;
    }

    if buf.len() >= cap {
        buf.extend_from_slice(TRUNCATION_MARKER);
        return;
    }

    let remaining = cap - buf.len();
    if data.len() <= remaining {
        buf.extend_from_slice(data);
    } else {
        buf.extend_from_slice(&data[..remaining]);
        buf.extend_from_slice(TRUNCATION_MARKER);
    }
}
