//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Logging and service identity
//! - Subscribe and publish QoS levels
//! - Primary and secondary broker endpoints
//! - Topic sets and worker counts per direction
//! - Environment variable overrides (MQTT_BRIDGE__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::protocol::QoS;
use crate::topic::{validate_topic_filter, validate_topic_name};

pub use endpoint::{
    AuthMode, EndpointConfig, DEFAULT_MQTT_PORT, PRIMARY_CLIENT_ID, PRIMARY_NAME,
    SECONDARY_CLIENT_ID, SECONDARY_NAME,
};

mod endpoint;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Default topics forwarded from the primary to the secondary broker
pub const DEFAULT_PRIMARY_TO_SECONDARY_TOPICS: &[&str] = &["viewtech/update", "viewtech/status"];

/// Default topics forwarded from the secondary to the primary broker
pub const DEFAULT_SECONDARY_TO_PRIMARY_TOPICS: &[&str] = &["monitor/viewtech/+", "sensor/antenna"];

/// Default number of workers per direction
pub const DEFAULT_WORKERS: usize = 5;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Service identity and mode
    #[serde(default)]
    pub service: ServiceConfig,
    /// QoS levels
    #[serde(default)]
    pub qos: QosConfig,
    /// Primary broker (also carries the monitoring topics)
    #[serde(default = "EndpointConfig::primary")]
    pub primary: EndpointConfig,
    /// Secondary broker
    #[serde(default = "EndpointConfig::secondary")]
    pub secondary: EndpointConfig,
    /// Topics bridged from primary to secondary
    #[serde(default = "DirectionConfig::primary_to_secondary")]
    pub primary_to_secondary: DirectionConfig,
    /// Topics bridged from secondary to primary
    #[serde(default = "DirectionConfig::secondary_to_primary")]
    pub secondary_to_primary: DirectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            service: ServiceConfig::default(),
            qos: QosConfig::default(),
            primary: EndpointConfig::primary(),
            secondary: EndpointConfig::secondary(),
            primary_to_secondary: DirectionConfig::primary_to_secondary(),
            secondary_to_primary: DirectionConfig::secondary_to_primary(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Service identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, last level of the monitoring topics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Also announce startup on the secondary broker
    #[serde(default)]
    pub debug: bool,
}

fn default_service_name() -> String {
    "mqtt_bridge".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            debug: false,
        }
    }
}

/// QoS levels for subscriptions and forwarded publishes.
///
/// The two are independent: forwarded messages may be republished with a
/// stronger guarantee than they were received with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// QoS requested for every source subscription
    #[serde(default = "default_subscribe_qos")]
    pub subscribe: u8,
    /// QoS used for forwarded and monitoring publishes
    #[serde(default = "default_publish_qos")]
    pub publish: u8,
}

fn default_subscribe_qos() -> u8 {
    0
}

fn default_publish_qos() -> u8 {
    2
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            subscribe: default_subscribe_qos(),
            publish: default_publish_qos(),
        }
    }
}

impl QosConfig {
    /// Subscription QoS (validated at load time)
    pub fn subscribe_qos(&self) -> QoS {
        QoS::from_u8(self.subscribe).unwrap_or(QoS::AtMostOnce)
    }

    /// Publish QoS (validated at load time)
    pub fn publish_qos(&self) -> QoS {
        QoS::from_u8(self.publish).unwrap_or(QoS::ExactlyOnce)
    }
}

/// One bridge direction: the source topics and the size of its worker pool
#[derive(Debug, Clone, Deserialize)]
pub struct DirectionConfig {
    /// Topic filters subscribed on the source broker
    pub topics: Vec<String>,
    /// Number of workers republishing to the destination broker
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl DirectionConfig {
    fn with_topics(topics: &[&str]) -> Self {
        Self {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            workers: default_workers(),
        }
    }

    /// Default primary to secondary direction
    pub fn primary_to_secondary() -> Self {
        Self::with_topics(DEFAULT_PRIMARY_TO_SECONDARY_TOPICS)
    }

    /// Default secondary to primary direction
    pub fn secondary_to_primary() -> Self {
        Self::with_topics(DEFAULT_SECONDARY_TO_PRIMARY_TOPICS)
    }

    fn validate(&self, section: &str) -> Result<(), String> {
        if self.workers == 0 {
            return Err(format!("{}.workers must be at least 1", section));
        }
        for topic in &self.topics {
            validate_topic_filter(topic)
                .map_err(|e| format!("{}.topics: '{}': {}", section, topic, e))?;
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTT_BRIDGE__` prefix with double underscores for nesting:
    ///    - `MQTT_BRIDGE__PRIMARY__SYSTEM_KEY=abc` overrides `primary.system_key`
    ///    - `MQTT_BRIDGE__QOS__PUBLISH=1` overrides `qos.publish`
    ///    - `MQTT_BRIDGE__SECONDARY_TO_PRIMARY__TOPICS=a/b,c/+` overrides a topic set
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, for callers that
    /// apply further overrides before validating.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("service.name", "mqtt_bridge")?
            .set_default("service.debug", false)?
            .set_default("qos.subscribe", 0)?
            .set_default("qos.publish", 2)?
            .set_default("primary.name", PRIMARY_NAME)?
            .set_default("primary.client_id", PRIMARY_CLIENT_ID)?
            .set_default("secondary.name", SECONDARY_NAME)?
            .set_default("secondary.client_id", SECONDARY_CLIENT_ID)?
            .set_default(
                "primary_to_secondary.topics",
                DEFAULT_PRIMARY_TO_SECONDARY_TOPICS.to_vec(),
            )?
            .set_default("primary_to_secondary.workers", DEFAULT_WORKERS as u64)?
            .set_default(
                "secondary_to_primary.topics",
                DEFAULT_SECONDARY_TO_PRIMARY_TOPICS.to_vec(),
            )?
            .set_default("secondary_to_primary.workers", DEFAULT_WORKERS as u64)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (MQTT_BRIDGE__PRIMARY__EMAIL, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTT_BRIDGE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("primary_to_secondary.topics")
                    .with_list_parse_key("secondary_to_primary.topics")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.fill_identities();
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.fill_identities();
        config.validate()?;
        Ok(config)
    }

    fn fill_identities(&mut self) {
        self.primary.fill_identity(PRIMARY_NAME, PRIMARY_CLIENT_ID);
        self.secondary
            .fill_identity(SECONDARY_NAME, SECONDARY_CLIENT_ID);
    }

    /// Monitoring topic for informational messages
    pub fn info_topic(&self) -> String {
        format!("log/info/{}", self.service.name)
    }

    /// Monitoring topic for fatal messages
    pub fn fatal_topic(&self) -> String {
        format!("log/fatal/{}", self.service.name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.is_empty() {
            return Err(ConfigError::Validation(
                "service.name cannot be empty".to_string(),
            ));
        }
        validate_topic_name(&self.info_topic()).map_err(|e| {
            ConfigError::Validation(format!("service.name '{}': {}", self.service.name, e))
        })?;

        if self.qos.subscribe > 2 {
            return Err(ConfigError::Validation(
                "qos.subscribe must be 0, 1, or 2".to_string(),
            ));
        }
        if self.qos.publish > 2 {
            return Err(ConfigError::Validation(
                "qos.publish must be 0, 1, or 2".to_string(),
            ));
        }

        self.primary
            .validate("primary")
            .map_err(ConfigError::Validation)?;
        self.secondary
            .validate("secondary")
            .map_err(ConfigError::Validation)?;

        if self.primary.client_id == self.secondary.client_id
            && self.primary.parse_address() == self.secondary.parse_address()
        {
            return Err(ConfigError::Validation(format!(
                "primary and secondary share client_id '{}' on the same broker",
                self.primary.client_id
            )));
        }

        self.primary_to_secondary
            .validate("primary_to_secondary")
            .map_err(ConfigError::Validation)?;
        self.secondary_to_primary
            .validate("secondary_to_primary")
            .map_err(ConfigError::Validation)?;

        Ok(())
    }
}
