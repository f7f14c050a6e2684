//! Configuration module for workerlink.
//!
//! Handles the settings file, environment variable expansion and validation.

mod settings;

pub use settings::{
    expand_env_vars, PoolSettings, Settings, SettingsError, WorkerSettings, CONFIG_ENV_VAR,
};
