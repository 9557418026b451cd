//! Application configuration.
//!
//! Aggregates broker, messaging and replica tables into a single Config
//! struct that can be loaded from YAML files or environment variables.
//!
//! The replica tables mirror the keys the holiday service has always used:
//! `Queues:<replica>`, `Ports:<replica>` and `ConnectionStrings:replicaName`
//! become the `queues`, `ports` and `connection_strings` maps. Lookups into
//! them ignore ASCII case, since the config loader lowercases keys.

mod broker;
mod messaging;
mod replica;

pub use broker::BrokerConfig;
pub use messaging::{BrokerBackend, MessagingConfig};
pub use replica::{replica_name_from_args, ReplicaConfig};

use std::collections::HashMap;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HOLIDAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HOLIDAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HOLIDAY_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "HOLIDAY_LOG_FORMAT";
/// Startup argument naming the replica.
pub const REPLICA_NAME_ARG: &str = "--replicaName";
/// Key under `connection_strings` holding the default replica name.
pub const REPLICA_NAME_KEY: &str = "replicaName";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("No replica name: pass --replicaName=<name> or set connection_strings.replicaName")]
    MissingReplicaName,

    #[error("No queue configured for replica '{0}' (Queues:{0})")]
    UnknownQueue(String),

    #[error("No port configured for replica '{0}' (Ports:{0})")]
    UnknownPort(String),

    #[error("Invalid port '{value}' for replica '{replica}'")]
    InvalidPort { replica: String, value: String },

    #[error("Invalid broker configuration: {0}")]
    InvalidBroker(String),

    #[error("Empty queue name for the {0} consumer")]
    EmptyQueueName(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Exchange and delivery settings.
    pub messaging: MessagingConfig,
    /// Base queue name per replica.
    pub queues: HashMap<String, String>,
    /// Listening port per replica.
    pub ports: HashMap<String, String>,
    /// Named settings; `replicaName` is the fallback replica identity.
    pub connection_strings: HashMap<String, String>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }

    /// `Queues:<replica>`
    pub fn queue_for_replica(&self, replica: &str) -> Option<&str> {
        lookup(&self.queues, replica)
    }

    /// `Ports:<replica>`
    pub fn port_for_replica(&self, replica: &str) -> Option<&str> {
        lookup(&self.ports, replica)
    }

    /// `ConnectionStrings:replicaName`
    pub fn default_replica_name(&self) -> Option<&str> {
        lookup(&self.connection_strings, REPLICA_NAME_KEY)
    }
}

fn lookup<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key)
        .or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.messaging.exchange, "logs");
        assert!(config.queues.is_empty());
        assert!(config.default_replica_name().is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
broker:
  hostname: rabbit.internal
  port: 5673
  username: holiday
  password: secret

messaging:
  type: memory
  publisher_confirms: true

queues:
  Repl1: repl1
  Repl2: repl2

ports:
  Repl1: "5011"
  Repl2: "5012"

connection_strings:
  replicaName: Repl2
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.hostname, "rabbit.internal");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.messaging.backend, BrokerBackend::Memory);
        assert!(config.messaging.publisher_confirms);
        assert_eq!(config.queue_for_replica("Repl1"), Some("repl1"));
        assert_eq!(config.port_for_replica("Repl2"), Some("5012"));
        assert_eq!(config.default_replica_name(), Some("Repl2"));
    }

    #[test]
    fn test_lookup_ignores_case() {
        let mut config = Config::default();
        config.queues.insert("repl1".to_string(), "repl1".to_string());
        config
            .connection_strings
            .insert("replicaname".to_string(), "Repl1".to_string());

        assert_eq!(config.queue_for_replica("Repl1"), Some("repl1"));
        assert_eq!(config.default_replica_name(), Some("Repl1"));
        assert_eq!(config.queue_for_replica("Repl3"), None);
    }

    #[test]
    #[serial]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  hostname: from-file\n  username: guest\n  password: guest\nqueues:\n  Repl1: repl1\nports:\n  Repl1: \"5011\""
        )
        .unwrap();

        std::env::set_var("HOLIDAY__BROKER__HOSTNAME", "from-env");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("HOLIDAY__BROKER__HOSTNAME");

        let config = config.unwrap();
        assert_eq!(config.broker.hostname, "from-env");
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.queue_for_replica("Repl1"), Some("repl1"));
        assert_eq!(config.port_for_replica("Repl1"), Some("5011"));
    }

    #[test]
    #[serial]
    fn test_load_missing_required_file_fails() {
        let result = Config::load(Some("/nonexistent/holiday.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
