//! Configuration management for the relay messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "zkchat.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "ZKCHAT";

/// Complete configuration for the messenger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Relay connection settings
    pub relay: RelayConfig,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// Client-side admission control
    pub rate_limit: RateLimitConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Relay connection and liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Seconds to wait for the first pong after connecting
    pub liveness_timeout_secs: u64,
    /// Seconds between liveness probes while live
    pub probe_interval_secs: u64,
    /// First reconnect delay in seconds, doubled per attempt
    pub backoff_base_secs: u64,
    /// Upper bound on a single reconnect delay
    pub backoff_max_secs: u64,
    /// Attempts before the connection is declared failed
    pub max_reconnect_attempts: u32,
    /// Pause before a manual reconnect, in milliseconds
    pub reconnect_cooloff_ms: u64,
    /// Outbound frames held while the connection is down
    pub max_pending_frames: usize,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name sent to peers inside the encrypted channel
    pub display_name: String,
    /// Hours a session lives without activity
    pub expiry_hours: i64,
    /// Seconds of silence before a typing indicator clears
    pub typing_decay_secs: u64,
    /// Maximum plaintext message size in bytes
    pub max_message_bytes: usize,
}

/// Cooldowns and windows for user-triggered network actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum gap between messages, in milliseconds
    pub message_cooldown_ms: u64,
    /// Messages allowed per window
    pub message_max_per_window: u32,
    /// Message window length in seconds
    pub message_window_secs: u64,
    /// Minimum gap between pings, in seconds
    pub ping_cooldown_secs: u64,
    /// Pings allowed per window
    pub ping_max_per_window: u32,
    /// Ping window length in seconds
    pub ping_window_secs: u64,
    /// Minimum gap between typing indicators, in milliseconds
    pub typing_cooldown_ms: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for identity and session records
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: crate::defaults::DEFAULT_RELAY_URL.to_string(),
            liveness_timeout_secs: 5,
            probe_interval_secs: 25,
            backoff_base_secs: 2,
            backoff_max_secs: 30,
            max_reconnect_attempts: 10,
            reconnect_cooloff_ms: 1000,
            max_pending_frames: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            expiry_hours: crate::defaults::SESSION_EXPIRY_HOURS,
            typing_decay_secs: 3,
            max_message_bytes: crate::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_cooldown_ms: 300,
            message_max_per_window: 30,
            message_window_secs: 60,
            ping_cooldown_secs: 30,
            ping_max_per_window: 5,
            ping_window_secs: 600,
            typing_cooldown_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("zkchat"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Liveness timeout as a duration
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Probe interval as a duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Manual reconnect cool-off as a duration
    pub fn reconnect_cooloff(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooloff_ms)
    }
}

impl SessionConfig {
    /// Session lifetime as a chrono duration
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours)
    }

    /// Typing decay as a duration
    pub fn typing_decay(&self) -> Duration {
        Duration::from_secs(self.typing_decay_secs)
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit path that does not exist is an error; the default
    /// locations are only consulted when no path is given.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::from_file(path)?;
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("zkchat")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|p| p.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var(format!("{ENV_PREFIX}_RELAY_URL")) {
            self.relay.url = url;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(name) = std::env::var(format!("{ENV_PREFIX}_DISPLAY_NAME")) {
            self.session.display_name = name;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, value: impl ToString) -> crate::MessengerError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
            .into()
        }

        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return Err(invalid("relay.url", &self.relay.url));
        }

        let relay_timings = [
            ("relay.liveness_timeout_secs", self.relay.liveness_timeout_secs),
            ("relay.probe_interval_secs", self.relay.probe_interval_secs),
            ("relay.backoff_base_secs", self.relay.backoff_base_secs),
            ("relay.backoff_max_secs", self.relay.backoff_max_secs),
        ];
        for (field, value) in relay_timings {
            if value == 0 {
                return Err(invalid(field, value));
            }
        }

        if self.relay.max_reconnect_attempts == 0 {
            return Err(invalid("relay.max_reconnect_attempts", 0));
        }

        if self.session.expiry_hours <= 0 {
            return Err(invalid("session.expiry_hours", self.session.expiry_hours));
        }

        if self.session.display_name.trim().is_empty() {
            return Err(invalid("session.display_name", "<empty>"));
        }

        if self.rate_limit.message_max_per_window == 0 || self.rate_limit.ping_max_per_window == 0 {
            return Err(invalid("rate_limit.*_max_per_window", 0));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure the data directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.liveness_timeout(), Duration::from_secs(5));
        assert_eq!(config.relay.probe_interval(), Duration::from_secs(25));
        assert_eq!(config.relay.max_reconnect_attempts, 10);
        assert_eq!(config.session.expiry(), chrono::Duration::days(3));
    }

    #[test]
    fn test_config_serialization() {
        let config = MessengerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("liveness_timeout_secs"));
        assert!(toml_str.contains("message_cooldown_ms"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = MessengerConfig::default();
        config.relay.url = "wss://relay.example.org/ws".to_string();
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.relay.url, "wss://relay.example.org/ws");
        assert_eq!(loaded.rate_limit.ping_cooldown_secs, config.rate_limit.ping_cooldown_secs);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[session]\ndisplay_name = \"Mallory\"\n").unwrap();

        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.session.display_name, "Mallory");
        assert_eq!(loaded.session.typing_decay_secs, 3);
        assert_eq!(loaded.relay.backoff_max_secs, 30);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MessengerConfig::default();
        config.relay.url = "http://relay".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.relay.liveness_timeout_secs = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.session.display_name = "   ".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("ZKCHAT_RELAY_URL", "ws://127.0.0.1:9000");

        let config = MessengerConfig::default().merge_from_env().unwrap();
        assert_eq!(config.relay.url, "ws://127.0.0.1:9000");

        std::env::remove_var("ZKCHAT_RELAY_URL");
    }
}
