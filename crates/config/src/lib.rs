//! Configuration management for the parley backend
//!
//! Supports loading configuration from:
//! - TOML files (`config/default.toml`, then `config/{env}.toml`)
//! - Environment variables (`PARLEY__` prefix, `__` separator)
//!
//! All operational knobs (timeouts, eviction horizons, buffer sizes) have
//! serde defaults sourced from [`constants`], so an empty config file plus an
//! `encryption_key` is a working deployment.

pub mod constants;
pub mod settings;

pub use settings::{load_settings, LogConfig, ServerConfig, Settings};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),
}
