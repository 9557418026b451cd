//! Replica identity resolution.
//!
//! A replica learns who it is once, at startup: an explicit
//! `--replicaName=<name>` argument wins, otherwise the configured
//! `connection_strings.replicaName`. The name then selects the replica's
//! base queue name and listening port. Any gap is a startup-fatal error,
//! raised before a single consumer is configured.

use tracing::info;

use super::{Config, ConfigError, REPLICA_NAME_ARG};
use crate::consumer::ConsumerDomain;

/// Resolved identity of this replica. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub replica_name: String,
    /// Base queue name; each consumer domain appends its own suffix.
    pub queue_name: String,
    pub port: u16,
}

impl ReplicaConfig {
    /// Resolve the replica from process arguments and configuration.
    pub fn resolve<S: AsRef<str>>(args: &[S], config: &Config) -> Result<Self, ConfigError> {
        let (replica_name, source) = match replica_name_from_args(args) {
            Some(name) => (name, "argument"),
            None => (
                config
                    .default_replica_name()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or(ConfigError::MissingReplicaName)?
                    .to_string(),
                "configuration",
            ),
        };

        let queue_name = config
            .queue_for_replica(&replica_name)
            .map(str::trim)
            .filter(|queue| !queue.is_empty())
            .ok_or_else(|| ConfigError::UnknownQueue(replica_name.clone()))?
            .to_string();

        let raw_port = config
            .port_for_replica(&replica_name)
            .ok_or_else(|| ConfigError::UnknownPort(replica_name.clone()))?;
        let port = raw_port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                replica: replica_name.clone(),
                value: raw_port.to_string(),
            })?;

        info!(
            replica = %replica_name,
            source,
            queue = %queue_name,
            port,
            "Resolved replica"
        );

        Ok(Self {
            replica_name,
            queue_name,
            port,
        })
    }

    /// Queue name for one consumer domain, e.g. `repl1-holiday`.
    ///
    /// Every domain gets its own queue so two controllers in one replica
    /// never compete for the same messages.
    pub fn queue_for(&self, domain: ConsumerDomain) -> String {
        format!("{}-{}", self.queue_name, domain.queue_suffix())
    }
}

/// Extract the replica name from `--replicaName=<name>` or
/// `--replicaName <name>`. Empty values are treated as absent.
pub fn replica_name_from_args<S: AsRef<str>>(args: &[S]) -> Option<String> {
    let mut iter = args.iter().map(|arg| arg.as_ref());
    while let Some(arg) = iter.next() {
        let value = match arg.strip_prefix(REPLICA_NAME_ARG) {
            Some(rest) if rest.starts_with('=') => Some(&rest[1..]),
            Some("") => iter.next(),
            _ => None,
        };
        if let Some(name) = value.map(str::trim).filter(|name| !name.is_empty()) {
            return Some(name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        for (name, queue, port) in [("Repl1", "repl1", "5011"), ("Repl2", "repl2", "5012")] {
            config.queues.insert(name.to_string(), queue.to_string());
            config.ports.insert(name.to_string(), port.to_string());
        }
        config
            .connection_strings
            .insert("replicaName".to_string(), "Repl2".to_string());
        config
    }

    #[test]
    fn test_argument_wins_over_configuration() {
        let args = ["holiday-replica", "--replicaName=Repl1"];
        let replica = ReplicaConfig::resolve(&args, &config()).unwrap();
        assert_eq!(
            replica,
            ReplicaConfig {
                replica_name: "Repl1".to_string(),
                queue_name: "repl1".to_string(),
                port: 5011,
            }
        );
    }

    #[test]
    fn test_falls_back_to_configured_name() {
        let args = ["holiday-replica"];
        let replica = ReplicaConfig::resolve(&args, &config()).unwrap();
        assert_eq!(replica.replica_name, "Repl2");
        assert_eq!(replica.port, 5012);
    }

    #[test]
    fn test_separate_value_argument() {
        let args = ["--replicaName", "Repl1"];
        assert_eq!(replica_name_from_args(&args).as_deref(), Some("Repl1"));
    }

    #[test]
    fn test_empty_argument_is_ignored() {
        let args = ["--replicaName="];
        assert_eq!(replica_name_from_args(&args), None);
        let replica = ReplicaConfig::resolve(&args, &config()).unwrap();
        assert_eq!(replica.replica_name, "Repl2");
    }

    #[test]
    fn test_similar_flag_is_not_matched() {
        let args = ["--replicaNameSuffix=x"];
        assert_eq!(replica_name_from_args(&args), None);
    }

    #[test]
    fn test_missing_replica_name() {
        let mut config = config();
        config.connection_strings.clear();
        let args: [&str; 0] = [];
        let result = ReplicaConfig::resolve(&args, &config);
        assert!(matches!(result, Err(ConfigError::MissingReplicaName)));
    }

    #[test]
    fn test_unknown_replica_has_no_queue() {
        let args = ["--replicaName=Repl9"];
        let result = ReplicaConfig::resolve(&args, &config());
        assert!(matches!(result, Err(ConfigError::UnknownQueue(name)) if name == "Repl9"));
    }

    #[test]
    fn test_replica_without_port() {
        let mut config = config();
        config.ports.remove("Repl1");
        let args = ["--replicaName=Repl1"];
        let result = ReplicaConfig::resolve(&args, &config);
        assert!(matches!(result, Err(ConfigError::UnknownPort(_))));
    }

    #[test]
    fn test_invalid_port() {
        let mut config = config();
        config.ports.insert("Repl1".to_string(), "http".to_string());
        let args = ["--replicaName=Repl1"];
        let result = ReplicaConfig::resolve(&args, &config);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidPort { value, .. }) if value == "http"
        ));
    }

    #[test]
    fn test_queue_per_domain() {
        let replica = ReplicaConfig::resolve(&["--replicaName=Repl1"], &config()).unwrap();
        assert_eq!(replica.queue_for(ConsumerDomain::Holiday), "repl1-holiday");
        assert_eq!(replica.queue_for(ConsumerDomain::ColaboratorId), "repl1-colab");
    }
}
