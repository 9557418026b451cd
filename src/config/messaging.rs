//! Messaging and exchange configuration types.

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::bus::{ExchangeDescriptor, EXCHANGE_NAME};
use crate::utils::retry::handler_backoff;

/// Broker backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// AMQP/RabbitMQ.
    #[default]
    Amqp,
    /// In-process broker (no external dependency, single process only).
    Memory,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Backend discriminator.
    #[serde(rename = "type")]
    pub backend: BrokerBackend,
    /// Fanout exchange all replicas publish to.
    pub exchange: String,
    /// Declare consumer queues durable so they keep messages across
    /// consumer disconnects.
    pub durable_queues: bool,
    /// Wait for the broker to confirm each publish.
    pub publisher_confirms: bool,
    /// Route rejected messages to a per-queue dead-letter queue.
    pub dead_letter: bool,
    /// In-place retries of a transiently failing handler.
    pub handler_retries: u32,
    /// Publish retries (each on a fresh channel) after a failed attempt.
    pub publish_retries: u32,
    /// Unacknowledged deliveries per consumer channel.
    pub prefetch: u16,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Amqp,
            exchange: EXCHANGE_NAME.to_string(),
            durable_queues: true,
            publisher_confirms: false,
            dead_letter: true,
            handler_retries: 3,
            publish_retries: 2,
            prefetch: 1,
        }
    }
}

impl MessagingConfig {
    /// The fanout exchange to declare.
    pub fn exchange_descriptor(&self) -> ExchangeDescriptor {
        ExchangeDescriptor::fanout(&self.exchange)
    }

    /// Retry policy for change handlers.
    pub fn handler_retry(&self) -> ExponentialBuilder {
        handler_backoff(self.handler_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ExchangeKind;
    use backon::BackoffBuilder;

    #[test]
    fn test_messaging_config_default() {
        let config = MessagingConfig::default();
        assert_eq!(config.backend, BrokerBackend::Amqp);
        assert_eq!(config.exchange, "logs");
        assert!(config.durable_queues);
        assert!(!config.publisher_confirms);
        assert_eq!(config.prefetch, 1);
    }

    #[test]
    fn test_exchange_descriptor_is_fanout() {
        let config = MessagingConfig {
            exchange: "holiday.changes".to_string(),
            ..Default::default()
        };
        let exchange = config.exchange_descriptor();
        assert_eq!(exchange.name, "holiday.changes");
        assert_eq!(exchange.kind, ExchangeKind::Fanout);
    }

    #[test]
    fn test_handler_retry_budget() {
        let config = MessagingConfig {
            handler_retries: 5,
            ..Default::default()
        };
        assert_eq!(config.handler_retry().build().count(), 5);
    }
}
