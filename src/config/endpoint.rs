//! Endpoint Configuration
//!
//! Connection and credential settings for one of the two bridged brokers.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;

/// Default MQTT port when the messaging URL carries none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Name of the primary endpoint when none is configured
pub const PRIMARY_NAME: &str = "ClearBlade";
/// Client identifier of the primary endpoint when none is configured
pub const PRIMARY_CLIENT_ID: &str = "cb_mqtt_bridge";
/// Name of the secondary endpoint when none is configured
pub const SECONDARY_NAME: &str = "View Technologies";
/// Client identifier of the secondary endpoint when none is configured
pub const SECONDARY_CLIENT_ID: &str = "vt_mqtt_bridge";

/// How the endpoint obtains its MQTT credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Exchange email/password for a user token over the platform REST API,
    /// then connect with the token as username and the system key as password
    #[default]
    Platform,
    /// Connect with email as username and password as password
    Basic,
    /// Connect without credentials
    Anonymous,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Platform => write!(f, "platform"),
            AuthMode::Basic => write!(f, "basic"),
            AuthMode::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Configuration for one broker endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Display name used in logs and failure reports
    #[serde(default)]
    pub name: String,

    /// MQTT client identifier
    #[serde(default)]
    pub client_id: String,

    /// Platform REST base URL (used by platform authentication)
    #[serde(default)]
    pub platform_url: String,

    /// MQTT broker address (`host:port`, optionally prefixed with `tcp://`)
    #[serde(default)]
    pub messaging_url: String,

    /// System key
    #[serde(default)]
    pub system_key: String,

    /// System secret
    #[serde(default)]
    pub system_secret: String,

    /// Account email
    #[serde(default)]
    pub email: String,

    /// Account password
    #[serde(default)]
    pub password: String,

    /// Credential mode
    #[serde(default)]
    pub auth: AuthMode,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Timeout for authentication, TCP connect and CONNACK
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Largest inbound packet accepted from the broker
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_keepalive() -> u16 {
    30
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl EndpointConfig {
    fn with_identity(name: &str, client_id: &str) -> Self {
        Self {
            name: name.to_string(),
            client_id: client_id.to_string(),
            platform_url: String::new(),
            messaging_url: String::new(),
            system_key: String::new(),
            system_secret: String::new(),
            email: String::new(),
            password: String::new(),
            auth: AuthMode::default(),
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }

    /// Defaults for the primary endpoint
    pub fn primary() -> Self {
        Self::with_identity(PRIMARY_NAME, PRIMARY_CLIENT_ID)
    }

    /// Defaults for the secondary endpoint
    pub fn secondary() -> Self {
        Self::with_identity(SECONDARY_NAME, SECONDARY_CLIENT_ID)
    }

    /// Fill an unset name or client id
    pub(crate) fn fill_identity(&mut self, name: &str, client_id: &str) {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        if self.client_id.is_empty() {
            self.client_id = client_id.to_string();
        }
    }

    /// Parse the messaging URL into host and port
    pub fn parse_address(&self) -> (String, u16) {
        let address = self
            .messaging_url
            .strip_prefix("tcp://")
            .or_else(|| self.messaging_url.strip_prefix("mqtt://"))
            .unwrap_or(&self.messaging_url)
            .trim_end_matches('/');

        if let Some((host, port_str)) = address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (address.to_string(), DEFAULT_MQTT_PORT)
    }

    /// Check the fields the configured auth mode depends on
    pub fn validate(&self, section: &str) -> Result<(), String> {
        if self.name.is_empty() {
            return Err(format!("{}.name cannot be empty", section));
        }
        if self.client_id.is_empty() {
            return Err(format!("{}.client_id cannot be empty", section));
        }
        if self.messaging_url.is_empty() {
            return Err(format!("{}.messaging_url is required", section));
        }
        if self.keepalive == 0 {
            return Err(format!("{}.keepalive must be at least 1 second", section));
        }

        let required: Vec<(&str, &str)> = match self.auth {
            AuthMode::Platform => vec![
                ("platform_url", self.platform_url.as_str()),
                ("system_key", self.system_key.as_str()),
                ("system_secret", self.system_secret.as_str()),
                ("email", self.email.as_str()),
                ("password", self.password.as_str()),
            ],
            AuthMode::Basic => vec![
                ("email", self.email.as_str()),
                ("password", self.password.as_str()),
            ],
            AuthMode::Anonymous => Vec::new(),
        };

        for (field, value) in required {
            if value.is_empty() {
                return Err(format!(
                    "{}.{} is required for {} authentication",
                    section, field, self.auth
                ));
            }
        }

        Ok(())
    }
}
