//! Configuration for the queue consumer
//!
//! TOML by default, JSON when the file ends in `.json`. The JSON loader also
//! accepts the flat `host` / `messagevpn` / `username` / `password` layout.
//! Every required parameter is checked before any connection attempt.

use crate::broker::mqtt::options::DEFAULT_CHANNEL_CAPACITY;
use crate::broker::mqtt::{parse_endpoint, MqttSessionSettings};
use crate::broker::ConnectionParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Files tried, in order, when no config path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["consumer.toml", "config/consumer.toml", "config.json"];

/// Main consumer configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

/// Broker connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with scheme and optional port
    #[serde(default, alias = "host")]
    pub url: String,
    /// Message-VPN / virtual host
    #[serde(default, alias = "messagevpn")]
    pub vpn: String,
    #[serde(default)]
    pub username: String,
    /// Inline password; takes precedence over `password_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable containing the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Start a fresh broker session instead of resuming the durable one
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Requests buffered between the client and its event loop
    #[serde(default = "default_request_channel_capacity")]
    pub request_channel_capacity: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            vpn: String::new(),
            username: String::new(),
            password: None,
            password_env: None,
            clean_session: false,
            keep_alive_secs: default_keep_alive(),
            request_channel_capacity: default_request_channel_capacity(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_queue_name")]
    pub name: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
        }
    }
}

fn default_queue_name() -> String {
    "Q.TEST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownSection {
    /// Time allowed for network teardown after the ordered shutdown
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    2000
}

/// Flat JSON layout with the connection fields at top level
#[derive(Debug, Clone, Deserialize)]
struct FlatJsonConfig {
    #[serde(default)]
    host: String,
    #[serde(default)]
    messagevpn: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, alias = "queueName")]
    queue: Option<String>,
}

impl From<FlatJsonConfig> for ConsumerConfig {
    fn from(flat: FlatJsonConfig) -> Self {
        let mut config = ConsumerConfig::default();
        config.broker.url = flat.host;
        config.broker.vpn = flat.messagevpn;
        config.broker.username = flat.username;
        config.broker.password = flat.password;
        if let Some(queue) = flat.queue {
            config.queue.name = queue;
        }
        config
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("No configuration file found (tried {0})")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsumerConfig {
    /// Load and validate configuration from a TOML or JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the first default location that exists
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        if let Some(path) = path {
            return Ok((Self::load_from_file(path)?, path.to_path_buf()));
        }

        for candidate in DEFAULT_CONFIG_PATHS {
            let candidate = Path::new(candidate);
            if candidate.exists() {
                return Ok((Self::load_from_file(candidate)?, candidate.to_path_buf()));
            }
        }

        Err(ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Parse JSON in either the sectioned or the flat layout
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if value.get("broker").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            let flat: FlatJsonConfig = serde_json::from_value(value)?;
            Ok(flat.into())
        }
    }

    /// Check every required parameter, reporting all missing ones together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.broker.url.trim().is_empty() {
            missing.push("broker.url");
        }
        if self.broker.vpn.trim().is_empty() {
            missing.push("broker.vpn");
        }
        if self.broker.username.trim().is_empty() {
            missing.push("broker.username");
        }
        let has_password = self.broker.password.as_deref().is_some_and(|p| !p.is_empty())
            || self
                .broker
                .password_env
                .as_deref()
                .is_some_and(|p| !p.is_empty());
        if !has_password {
            missing.push("broker.password");
        }
        if self.queue.name.trim().is_empty() {
            missing.push("queue.name");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingParameters(missing));
        }

        // Same check the session applies, so a bad scheme fails at startup.
        parse_endpoint(&self.broker.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("broker.url: {e}")))?;

        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "broker.keep_alive_secs must be at least 5".to_string(),
            ));
        }

        if self.broker.request_channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.request_channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Inline password, or the value of `password_env`
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        match (&self.broker.password, &self.broker.password_env) {
            (Some(password), _) if !password.is_empty() => Ok(password.clone()),
            (_, Some(env_var)) => std::env::var(env_var)
                .map_err(|_| ConfigError::EnvVarNotFound(env_var.clone())),
            _ => Err(ConfigError::MissingParameters(vec!["broker.password"])),
        }
    }

    pub fn connection_params(&self) -> Result<ConnectionParams, ConfigError> {
        Ok(ConnectionParams::new(
            self.broker.url.clone(),
            self.broker.vpn.clone(),
            self.broker.username.clone(),
            self.resolve_password()?,
        ))
    }

    pub fn session_settings(&self) -> MqttSessionSettings {
        MqttSessionSettings {
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            clean_session: self.broker.clean_session,
            channel_capacity: self.broker.request_channel_capacity,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    /// Copy safe to print: the inline password is masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.broker.password.is_some() {
            copy.broker.password = Some("***".to_string());
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "tcp://h:55555"
vpn = "v1"
username = "u"
password = "p"

[queue]
name = "Q.TEST"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
