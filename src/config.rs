//! TOML configuration for the push channel, REST API and purchase flow
//!
//! Every section has defaults, so an empty file (or no file at all) yields
//! a working configuration pointed at the test environment.

use crate::protocol::{validate_subject_token, ConnectOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub pubsub: PubSubSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub account: AccountSection,
    #[serde(default)]
    pub purchase: PurchaseSection,
}

/// Push channel section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PubSubSection {
    /// Broker WebSocket URL (`ws://` or `wss://`)
    #[serde(default = "default_pubsub_url")]
    pub url: String,
    /// First token of every device subject
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Settling delay before an operator-triggered reconnect
    #[serde(default = "default_manual_reconnect_delay_ms")]
    pub manual_reconnect_delay_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_pubsub_url() -> String {
    "wss://pubsub.mprc.cu".to_string()
}

fn default_namespace() -> String {
    "APKLIS_DEVICES_TEST".to_string()
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_manual_reconnect_delay_ms() -> u64 {
    2_000
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            url: default_pubsub_url(),
            namespace: default_namespace(),
            ping_interval_ms: default_ping_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            manual_reconnect_delay_ms: default_manual_reconnect_delay_ms(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl PubSubSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn manual_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.manual_reconnect_delay_ms)
    }

    /// The broker only ever gets the quiet, non-TLS-negotiated handshake
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("pubsub.url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidConfig(format!(
                "pubsub.url '{}' must use ws:// or wss://",
                self.url
            )));
        }
        validate_subject_token(&self.namespace).map_err(|e| {
            ConfigError::InvalidConfig(format!("pubsub.namespace '{}': {e}", self.namespace))
        })?;
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "pubsub.ping_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "pubsub.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.reconnect.validate()
    }
}

/// Automatic reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between attempts (>= 1.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    1.5
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "pubsub.reconnect.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "pubsub.reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "pubsub.reconnect.max_delay_ms ({}) must not be below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "pubsub.reconnect.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// License REST API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    /// Response header carrying the body signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

fn default_api_base_url() -> String {
    "https://apitest.apklis.cu".to_string()
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_signature_header() -> String {
    "signature".to_string()
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
            signature_header: default_signature_header(),
        }
    }
}

impl ApiSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("api.base_url '{}': {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "api.base_url '{}' must use http:// or https://",
                self.base_url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "api.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.signature_header.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "api.signature_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Names of the environment variables holding the account identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSection {
    #[serde(default = "default_account_code_env")]
    pub account_code_env: String,
    #[serde(default = "default_device_id_env")]
    pub device_id_env: String,
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_username_env")]
    pub username_env: String,
}

fn default_account_code_env() -> String {
    "APKLIS_ACCOUNT_CODE".to_string()
}

fn default_device_id_env() -> String {
    "APKLIS_DEVICE_ID".to_string()
}

fn default_access_token_env() -> String {
    "APKLIS_ACCESS_TOKEN".to_string()
}

fn default_username_env() -> String {
    "APKLIS_USERNAME".to_string()
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            account_code_env: default_account_code_env(),
            device_id_env: default_device_id_env(),
            access_token_env: default_access_token_env(),
            username_env: default_username_env(),
        }
    }
}

/// Purchase flow section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseSection {
    /// How long to wait for payment confirmation
    #[serde(default = "default_purchase_timeout_secs")]
    pub timeout_secs: u64,
    /// Reject API responses without a trusted signature
    #[serde(default = "default_require_signature")]
    pub require_signature: bool,
}

fn default_purchase_timeout_secs() -> u64 {
    300
}

fn default_require_signature() -> bool {
    true
}

impl Default for PurchaseSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_purchase_timeout_secs(),
            require_signature: default_require_signature(),
        }
    }
}

impl PurchaseSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pubsub.validate()?;
        self.api.validate()?;
        if self.purchase.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "purchase.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Read a required environment variable
    pub fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Create a test configuration with fast timers for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[pubsub]
url = "ws://localhost:4222"
namespace = "TEST_DEVICES"
ping_interval_ms = 200
connect_timeout_ms = 500
manual_reconnect_delay_ms = 20

[pubsub.reconnect]
max_attempts = 3
initial_delay_ms = 10
max_delay_ms = 50
multiplier = 2.0

[purchase]
timeout_secs = 5
require_signature = false
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}
