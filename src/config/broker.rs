//! Broker connection settings.

use std::fmt;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;

use super::ConfigError;

/// RabbitMQ connection configuration.
///
/// Hostname, port, username and password are all required; `validate`
/// rejects empty values before any connection attempt.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname.
    pub hostname: String,
    /// AMQP port.
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Connection retries at startup before giving up.
    pub connect_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5672,
            username: String::new(),
            password: String::new(),
            vhost: "/".to_string(),
            connect_retries: 10,
        }
    }
}

impl BrokerConfig {
    /// Check that every required setting is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<&str> = [
            ("hostname", self.hostname.trim().is_empty()),
            ("username", self.username.is_empty()),
            ("password", self.password.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::InvalidBroker(format!(
                "missing {}",
                missing.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidBroker("port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// AMQP URI with credentials and vhost percent-encoded.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.username, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.password, NON_ALPHANUMERIC),
            self.hostname,
            self.port,
            utf8_percent_encode(&self.vhost, NON_ALPHANUMERIC),
        )
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("connect_retries", &self.connect_retries)
            .finish()
    }
}
