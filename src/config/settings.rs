//! TOML-based configuration for workerlink.
//!
//! Supports a config file (workerlink.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! program = "${WORKER_HOME}/bin/my-worker"
//! args = ["--mode", "batch"]
//! cwd = "./data"
//!
//! [worker.env]
//! LOG_LEVEL = "info"
//!
//! [pool]
//! max_commands_running = 10
//! default_command_timeout_secs = 5.0
//! shutdown_grace_secs = 2.5
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::{PoolConfig, WorkerLauncher, DEFAULT_MAX_COMMANDS_RUNNING};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "WORKERLINK_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("No worker program configured")]
    MissingProgram,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// How to launch the worker.
    pub worker: WorkerSettings,

    /// Command pool limits.
    pub pool: PoolSettings,
}

/// Worker launch configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker program (supports ${ENV_VAR} expansion).
    pub program: Option<String>,

    /// Program arguments (supports ${ENV_VAR} expansion).
    pub args: Vec<String>,

    /// Working directory of the worker; defaults to the host's.
    pub cwd: Option<String>,

    /// Extra environment variables for the worker.
    pub env: HashMap<String, String>,
}

/// Command pool settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of commands in flight at once.
    pub max_commands_running: usize,

    /// Timeout applied to commands that do not set their own.
    pub default_command_timeout_secs: f64,

    /// Kill the worker if it has not exited this long after close.
    pub shutdown_grace_secs: Option<f64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_commands_running: DEFAULT_MAX_COMMANDS_RUNNING,
            default_command_timeout_secs: 5.0,
            shutdown_grace_secs: Some(5.0),
        }
    }
}

impl PoolSettings {
    /// Check limits and convert them for the pool.
    pub fn to_pool_config(&self) -> Result<PoolConfig, SettingsError> {
        if self.max_commands_running == 0 {
            return Err(SettingsError::InvalidConfig(
                "pool.max_commands_running must be at least 1".to_string(),
            ));
        }
        Ok(PoolConfig {
            max_commands_running: self.max_commands_running,
            default_timeout: positive_secs(
                "pool.default_command_timeout_secs",
                self.default_command_timeout_secs,
            )?,
        })
    }

    pub fn shutdown_grace(&self) -> Result<Option<Duration>, SettingsError> {
        self.shutdown_grace_secs
            .map(|secs| positive_secs("pool.shutdown_grace_secs", secs))
            .transpose()
    }
}

fn positive_secs(field: &str, secs: f64) -> Result<Duration, SettingsError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SettingsError::InvalidConfig(format!(
            "{field} must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|err| SettingsError::InvalidConfig(format!("{field}: {err}")))
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `WORKERLINK_CONFIG`
    /// 2. `./workerlink.toml`
    /// 3. `~/.config/workerlink/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("workerlink.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("workerlink").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Return defaults if no config file found
        Ok(Settings::default())
    }

    /// Build the worker launcher, expanding environment variables.
    pub fn launcher(&self) -> Result<WorkerLauncher, SettingsError> {
        let program = self
            .worker
            .program
            .as_deref()
            .ok_or(SettingsError::MissingProgram)?;

        let mut launcher = WorkerLauncher::new(expand_env_vars(program)?);
        for arg in &self.worker.args {
            launcher = launcher.arg(expand_env_vars(arg)?);
        }
        if let Some(cwd) = &self.worker.cwd {
            launcher = launcher.current_dir(expand_env_vars(cwd)?);
        }
        for (key, value) in &self.worker.env {
            launcher = launcher.env(key, expand_env_vars(value)?);
        }
        Ok(launcher)
    }

    pub fn pool_config(&self) -> Result<PoolConfig, SettingsError> {
        self.pool.to_pool_config()
    }

    pub fn shutdown_grace(&self) -> Result<Option<Duration>, SettingsError> {
        self.pool.shutdown_grace()
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.peek() == Some(&'{') {
            chars.next();
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
