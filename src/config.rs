// src/config.rs
//! Closed configuration record (spec §5/§6/§10.2). Every knob the core
//! consumes is a named field with a default; no open-ended key/value bags.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xdg::BaseDirectories;

use crate::errors::CoreError;

pub const APP_NAME: &str = "hostpilot";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

/// Top-level configuration, deserialized from `config.toml`.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            limits: LimitsConfig::default(),
            vault: VaultConfig::default(),
            model: ModelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// The default-limits bundle referenced by spec §6 ("a default-limits
/// bundle (heartbeat interval, idle timeout, per-step deadline, stdout
/// cap)"), plus the handful of other deadlines named across §4 and §5.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_deadline_secs")]
    pub connect_deadline_secs: u64,
    #[serde(default = "default_generator_deadline_secs")]
    pub generator_deadline_secs: u64,
    #[serde(default = "default_step_deadline_secs")]
    pub step_deadline_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_connect_deadline_secs() -> u64 {
    20
}
fn default_generator_deadline_secs() -> u64 {
    90
}
fn default_step_deadline_secs() -> u64 {
    120
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_max_sessions_per_user() -> usize {
    8
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_deadline_secs: default_connect_deadline_secs(),
            generator_deadline_secs: default_generator_deadline_secs(),
            step_deadline_secs: default_step_deadline_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_sessions_per_user: default_max_sessions_per_user(),
        }
    }
}

/// Credential Vault (C1) configuration.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Hex-encoded 32-byte key. If absent, a fresh key is generated at
    /// process start and a warning is logged once (spec §4.1).
    pub key_hex: Option<String>,
}

/// External model endpoint configuration, consumed only by the optional
/// `http-provider` feature's `PlanGenerator` implementation.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_model_endpoint() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}
fn default_model_name() -> String {
    "local-model".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            endpoint: default_model_endpoint(),
            api_key: None,
            model_name: default_model_name(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `config_path_override`, or the XDG config
    /// home, falling back to defaults with a warning if nothing is found.
    pub fn load(config_path_override: Option<&Path>) -> Result<Self, CoreError> {
        let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
        let config_path: PathBuf = match config_path_override {
            Some(path) => path.to_path_buf(),
            None => xdg_dirs
                .find_config_file(DEFAULT_CONFIG_FILENAME)
                .unwrap_or_else(|| xdg_dirs.get_config_home().join(DEFAULT_CONFIG_FILENAME)),
        };

        info!("attempting to load configuration from {:?}", config_path);

        let config = if config_path.exists() {
            let config_str = std::fs::read_to_string(&config_path)?;
            let parsed: AppConfig = toml::from_str(&config_str)?;
            debug!("loaded config: {:?}", parsed);
            parsed
        } else {
            warn!(
                "config file not found at {:?}; using default configuration",
                config_path
            );
            AppConfig::default()
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_bundle() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.heartbeat_interval_secs, 30);
        assert_eq!(limits.idle_timeout_secs, 3600);
        assert_eq!(limits.step_deadline_secs, 120);
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
        assert_eq!(limits.max_sessions_per_user, 8);
    }

    #[test]
    fn load_falls_back_to_defaults_when_missing() {
        let cfg = AppConfig::load(Some(Path::new("/nonexistent/hostpilot-test.toml"))).unwrap();
        assert_eq!(cfg.limits.heartbeat_interval_secs, 30);
    }

    #[test]
    fn load_parses_partial_overrides() {
        let dir = std::env::temp_dir().join(format!("hostpilot-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[limits]\nheartbeat_interval_secs = 5\n").unwrap();
        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.limits.heartbeat_interval_secs, 5);
        assert_eq!(cfg.limits.idle_timeout_secs, 3600);
        std::fs::remove_dir_all(&dir).ok();
    }
}
