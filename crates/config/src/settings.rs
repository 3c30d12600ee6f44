//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{bus, history, timeouts};
use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection string for the relational store
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Endpoint of the vector search service
    #[serde(default = "default_vector_store_url")]
    pub vector_store_url: String,

    /// Symmetric key for API-key at-rest encryption, 64 hex chars (32 bytes).
    /// Read once at startup and immutable afterwards.
    #[serde(default)]
    pub encryption_key: String,

    /// Per-LLM-call wall-clock timeout
    #[serde(default = "default_llm_call_timeout")]
    pub llm_call_timeout_seconds: u64,

    /// Idle horizon after which a session's runtime binding is evicted
    #[serde(default = "default_idle_eviction")]
    pub session_idle_eviction_seconds: u64,

    /// Upper bound on history messages loaded per turn; hard-capped at 128
    #[serde(default = "default_max_history")]
    pub max_history_per_request: u32,

    /// Buffered events per subscriber before a slow subscriber is dropped
    #[serde(default = "default_event_buffer")]
    pub event_bus_per_subscriber_buffer: usize,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When false a permissive CORS layer is installed (development only)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Fallback filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://parley.db?mode=rwc".to_string()
}

fn default_vector_store_url() -> String {
    "http://127.0.0.1:6334".to_string()
}

fn default_llm_call_timeout() -> u64 {
    timeouts::LLM_CALL_SECS
}

fn default_idle_eviction() -> u64 {
    timeouts::SESSION_IDLE_EVICTION_SECS
}

fn default_max_history() -> u32 {
    history::MAX_PER_REQUEST
}

fn default_event_buffer() -> usize {
    bus::PER_SUBSCRIBER_BUFFER
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database_url: default_database_url(),
            vector_store_url: default_vector_store_url(),
            encryption_key: String::new(),
            llm_call_timeout_seconds: default_llm_call_timeout(),
            session_idle_eviction_seconds: default_idle_eviction(),
            max_history_per_request: default_max_history(),
            event_bus_per_subscriber_buffer: default_event_buffer(),
            log: LogConfig::default(),
        }
    }
}

impl Settings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.encryption_key.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption_key is required (64 hex chars)".into(),
            ));
        }
        match hex::decode(&self.encryption_key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "encryption_key must decode to 32 bytes".into(),
                ))
            }
        }
        if self.llm_call_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "llm_call_timeout_seconds must be positive".into(),
            ));
        }
        if self.max_history_per_request == 0 || self.max_history_per_request > history::MAX_PER_REQUEST
        {
            return Err(ConfigError::Invalid(format!(
                "max_history_per_request must be in 1..={}",
                history::MAX_PER_REQUEST
            )));
        }
        if self.event_bus_per_subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_bus_per_subscriber_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Decoded encryption key bytes. Call after [`Settings::validate`].
    pub fn encryption_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(&self.encryption_key)
            .map_err(|_| ConfigError::Invalid("encryption_key is not valid hex".into()))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("encryption_key must decode to 32 bytes".into()))
    }
}

/// Load settings from files and environment.
///
/// Priority: env vars > `config/{env}.toml` > `config/default.toml` > defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("PARLEY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            encryption_key: "11".repeat(32),
            ..Settings::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.llm_call_timeout_seconds, 60);
        assert_eq!(settings.session_idle_eviction_seconds, 1800);
        assert_eq!(settings.event_bus_per_subscriber_buffer, 64);
    }

    #[test]
    fn test_validation_requires_key() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_key_must_be_32_bytes() {
        let mut settings = valid_settings();
        settings.encryption_key = "abcd".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_history_cap() {
        let mut settings = valid_settings();
        settings.max_history_per_request = 4096;
        assert!(settings.validate().is_err());
        settings.max_history_per_request = 128;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_key_bytes_round_trip() {
        let settings = valid_settings();
        let bytes = settings.encryption_key_bytes().unwrap();
        assert_eq!(bytes, [0x11u8; 32]);
    }
}
