// src/cli.rs
//! Developer harness over the core's six operations (spec §6, SPEC_FULL
//! §11 "CLI surface"). This is not the production HTTP adapter — it drives
//! the same core synchronously, one invocation per process, for local
//! smoke-testing. User identity is a bare `--user` flag standing in for
//! whatever the real adapter authenticates.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use hostpilot::CredentialMaterial;

/// hostpilot: natural-language infrastructure requests over gated SSH plans.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional path to the hostpilot configuration file.
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Opaque caller identity (stands in for the adapter's authenticated user).
    #[clap(long, default_value = "local")]
    pub user: String,

    /// Set log level.
    #[clap(long, value_name = "LEVEL", value_enum, default_value_t = LogLevelCli::Info)]
    pub log_level: LogLevelCli,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevelCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a session against a target host.
    Connect {
        #[clap(long)]
        hostname: String,
        #[clap(long, default_value_t = 22)]
        port: u16,
        #[clap(long)]
        username: String,
        /// Password auth. Mutually exclusive with `--key-file`.
        #[clap(long)]
        password: Option<String>,
        /// Private-key auth: path to a PEM-encoded key.
        #[clap(long, value_name = "FILE")]
        key_file: Option<PathBuf>,
        #[clap(long)]
        key_passphrase: Option<String>,
    },
    /// Close one session, or every session for this user if omitted.
    Disconnect {
        #[clap(long)]
        session_id: Option<Uuid>,
    },
    /// Show every live session for this user.
    Status,
    /// Submit a natural-language request against a connected session.
    Submit {
        #[clap(long)]
        session_id: Uuid,
        #[clap(long)]
        request: String,
    },
    /// Fetch a plan's current snapshot.
    GetPlan {
        #[clap(long)]
        plan_id: Uuid,
    },
    /// Approve or reject the next pending step.
    Respond {
        #[clap(long)]
        plan_id: Uuid,
        #[clap(long)]
        step_index: usize,
        #[clap(long)]
        approved: bool,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Approve or reject every remaining pending step in order.
    RespondAll {
        #[clap(long)]
        plan_id: Uuid,
        #[clap(long)]
        approved: bool,
    },
    /// Append a discussion message to a plan (never mutates its steps).
    Chat {
        #[clap(long)]
        plan_id: Uuid,
        #[clap(long)]
        message: String,
    },
    /// Signal client departure: terminates every session for this user.
    BeaconLeave,
}

/// Resolves the mutually-exclusive `--password`/`--key-file` pair into a
/// `CredentialMaterial`, reading the key file if given.
pub fn resolve_credential(
    password: Option<String>,
    key_file: Option<PathBuf>,
    key_passphrase: Option<String>,
) -> anyhow::Result<CredentialMaterial> {
    match (password, key_file) {
        (Some(password), None) => Ok(CredentialMaterial::Password(password)),
        (None, Some(path)) => {
            let expanded = shellexpand::full(&path.to_string_lossy())
                .map(|s| PathBuf::from(s.into_owned()))
                .unwrap_or(path);
            let pem = std::fs::read_to_string(&expanded)
                .map_err(|e| anyhow::anyhow!("failed to read key file {:?}: {e}", expanded))?;
            Ok(CredentialMaterial::PrivateKey { pem, passphrase: key_passphrase })
        }
        (Some(_), Some(_)) => Err(anyhow::anyhow!("--password and --key-file are mutually exclusive")),
        (None, None) => Err(anyhow::anyhow!("one of --password or --key-file is required")),
    }
}
