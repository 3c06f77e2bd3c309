//! Configuration for the shared messaging client
//!
//! Loaded from a TOML file. Secrets are never stored in the file itself; the
//! config names the environment variables that hold them and they are
//! resolved at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BusConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    /// REST sibling client (optional)
    pub api: Option<ApiSection>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with protocol and port, e.g. `mqtt://localhost:1883`
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Prefix for generated client identifiers
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Upper bound for a single connection attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl BrokerSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Resolve `(username, password)` from the configured environment variables
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }
}

fn default_client_id_prefix() -> String {
    "topicmux".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// None = retry until shutdown
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> u32 {
    2
}

/// Inbound delivery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeliverySection {
    /// Drop decoded payloads that are not valid inbound envelopes
    #[serde(default)]
    pub validate_inbound: bool,
}

/// REST client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    pub base_url: String,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
    /// Environment variable holding the token for public endpoints
    pub public_token_env: Option<String>,
    /// Environment variable holding the token for every other endpoint
    pub private_token_env: Option<String>,
    /// Path prefixes served with the public token
    #[serde(default)]
    pub public_paths: Vec<String>,
}

fn default_api_timeout_ms() -> u64 {
    15_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.broker.url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") || url.host_str().is_none() {
            return Err(ConfigError::InvalidBrokerUrl(self.broker.url.clone()));
        }

        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.multiplier == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms and reconnect.multiplier must be greater than 0"
                    .to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms".to_string(),
            ));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }

        if let Some(api) = &self.api {
            url::Url::parse(&api.base_url)
                .map_err(|e| ConfigError::InvalidConfig(format!("api.base_url: {e}")))?;
        }

        Ok(())
    }
}
