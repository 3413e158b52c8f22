//! Configuration management for the bridge
//!
//! This module handles loading, parsing, and managing configuration from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/aibridge/config.toml (or platform-specific location)
//! 3. An explicit `--config <path>` override

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Bind address in `host:port` form
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Session registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time before a session is reclaimed
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Spacing of expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// In-flight request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Deadline for a tool call before it is cancelled
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Conversation history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages kept per session before the oldest is evicted
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
        }
    }
}

/// SSE transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Spacing of heartbeat comments on idle streams
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl SseConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Conversational backend settings. Leaving `base_url` empty runs the bridge
/// with the scripted offline client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file_output: false,
            file_path: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8808
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_messages() -> usize {
    100
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl BridgeConfig {
    /// Load configuration with fallback chain:
    /// 1. Environment overrides (AIBRIDGE_HOST, AIBRIDGE_PORT, …)
    /// 2. User config ~/.config/aibridge/config.toml
    /// 3. Embedded default_config.toml
    pub fn load() -> ConfigResult<Self> {
        let mut config: BridgeConfig = toml::from_str(DEFAULT_CONFIG).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse default config: {}", e))
        })?;

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                match Self::load_from_file(&user_config_path) {
                    Ok(user_config) => {
                        tracing::info!("Loaded user config from {:?}", user_config_path);
                        config = user_config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load user config: {}", e);
                    }
                }
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `AIBRIDGE_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Override application with an injected variable lookup, so tests can
    /// drive it without touching the process environment
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("AIBRIDGE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("AIBRIDGE_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring non-numeric AIBRIDGE_PORT"),
            }
        }
        if let Some(timeout) = lookup("AIBRIDGE_REQUEST_TIMEOUT_SECS") {
            match timeout.parse() {
                Ok(secs) => self.request.timeout_secs = secs,
                Err(_) => {
                    tracing::warn!(value = %timeout, "ignoring non-numeric AIBRIDGE_REQUEST_TIMEOUT_SECS")
                }
            }
        }
        if let Some(base_url) = lookup("AIBRIDGE_UPSTREAM_URL") {
            self.upstream.base_url = Some(base_url);
        }
        if let Some(api_key) = lookup("AIBRIDGE_API_KEY") {
            self.upstream.api_key = Some(api_key);
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &PathBuf) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: BridgeConfig = toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the user config path (~/.config/aibridge/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("aibridge").join("config.toml"))
    }

    /// Reject values that would make the bridge misbehave at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.request.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.history.max_messages == 0 {
            return Err(ConfigError::Invalid(
                "history.max_messages must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            request: RequestConfig::default(),
            history: HistoryConfig::default(),
            sse: SseConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_config_is_valid() {
        let config: BridgeConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8808);
        assert_eq!(config.session.ttl_secs, 1800);
        assert_eq!(config.request.timeout_secs, 60);
        assert_eq!(config.history.max_messages, 100);
        assert!(config.upstream.base_url.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [upstream]
            base_url = "https://ai.example.com/api"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.session.ttl_secs, 1800);
        assert_eq!(
            config.upstream.base_url.as_deref(),
            Some("https://ai.example.com/api")
        );
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config: BridgeConfig = toml::from_str("[session]\nttl_secs = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file_round_trip() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[server]\nport = 9999\n\n[request]\ntimeout_secs = 5\n"
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.request.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file_reports_missing_file() {
        let path = PathBuf::from("/nonexistent/aibridge/config.toml");
        let err = BridgeConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::FileReadFailed { .. }));
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let vars = std::collections::HashMap::from([
            ("AIBRIDGE_PORT", "7070"),
            ("AIBRIDGE_UPSTREAM_URL", "https://env.example.com/api"),
            ("AIBRIDGE_REQUEST_TIMEOUT_SECS", "not-a-number"),
        ]);

        let mut config = BridgeConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7070);
        assert_eq!(
            config.upstream.base_url.as_deref(),
            Some("https://env.example.com/api")
        );
        // a non-numeric value is warned about and ignored
        assert_eq!(config.request.timeout_secs, 60);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = BridgeConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: BridgeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.server.port, config.server.port);
        assert_eq!(reparsed.sse.heartbeat_secs, config.sse.heartbeat_secs);
    }
}
