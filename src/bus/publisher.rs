//! Change publisher.
//!
//! Publishes change notifications to the fanout exchange with an empty
//! routing key. The publisher owns one channel, derived from the shared
//! connection and never handed to a consumer. A failed attempt discards the
//! channel; the next attempt opens a fresh one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BusError, ChangeEvent, ChannelHandle, ConnectionManager, ExchangeDescriptor, Result};
use crate::config::MessagingConfig;
use crate::utils::retry::publish_backoff;

/// Upstream hook the CRUD layer calls after a successful write.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Broadcast a change to every replica. Returns once the broker took
    /// the message (or confirmed it, with confirms enabled); never waits for
    /// consumers.
    async fn notify_change(&self, payload: Bytes) -> Result<()>;
}

/// Publisher for the change exchange.
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    exchange: ExchangeDescriptor,
    confirms: bool,
    publish_retries: u32,
    channel: Mutex<Option<ChannelHandle>>,
}

impl EventPublisher {
    /// Create a publisher and declare its exchange.
    ///
    /// Fails if no channel can be opened or the exchange cannot be
    /// declared.
    pub async fn new(
        connection: Arc<ConnectionManager>,
        exchange: ExchangeDescriptor,
        confirms: bool,
        publish_retries: u32,
    ) -> Result<Self> {
        let publisher = Self {
            connection,
            exchange,
            confirms,
            publish_retries,
            channel: Mutex::new(None),
        };

        let channel = publisher.open().await?;
        *publisher.channel.lock().await = Some(channel);

        info!(
            exchange = %publisher.exchange.name,
            confirms,
            "Publisher ready"
        );
        Ok(publisher)
    }

    /// Create a publisher from messaging configuration.
    pub async fn from_messaging(
        connection: Arc<ConnectionManager>,
        messaging: &MessagingConfig,
    ) -> Result<Self> {
        Self::new(
            connection,
            messaging.exchange_descriptor(),
            messaging.publisher_confirms,
            messaging.publish_retries,
        )
        .await
    }

    pub fn exchange(&self) -> &ExchangeDescriptor {
        &self.exchange
    }

    /// Publish a payload as a new change event.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %self.exchange.name))]
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<()> {
        let event = ChangeEvent::new(payload);
        self.publish_event(&event).await
    }

    /// Publish an event, retrying on a fresh channel after a failure.
    pub async fn publish_event(&self, event: &ChangeEvent) -> Result<()> {
        if self.connection.is_closed() {
            return Err(BusError::Publish("connection is shut down".to_string()));
        }

        let backoff = publish_backoff(self.publish_retries).build();

        let mut slot = self.channel.lock().await;
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            if !slot.as_ref().is_some_and(ChannelHandle::is_open) {
                if let Some(stale) = slot.take() {
                    let _ = stale.close().await;
                }
                match self.open().await {
                    Ok(channel) => {
                        debug!(attempt = attempt + 1, "Recreated publisher channel");
                        *slot = Some(channel);
                    }
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            max_retries = self.publish_retries,
                            error = %e,
                            "Failed to open publisher channel, retrying..."
                        );
                        last_error = Some(e);
                        continue;
                    }
                }
            }

            let Some(channel) = slot.as_ref() else {
                continue;
            };

            match channel.publish(&self.exchange.name, "", event).await {
                Ok(()) => {
                    debug!(bytes = event.payload().len(), "Published change");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.publish_retries,
                        error = %e,
                        "Publish failed, discarding channel"
                    );
                    if let Some(stale) = slot.take() {
                        let _ = stale.close().await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        error!(
            exchange = %self.exchange.name,
            attempts = self.publish_retries + 1,
            error = %reason,
            "Failed to publish change"
        );
        Err(BusError::Publish(format!(
            "giving up after {} attempts: {}",
            self.publish_retries + 1,
            reason
        )))
    }

    /// Release the publisher channel.
    pub async fn close(&self) -> Result<()> {
        match self.channel.lock().await.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Open a channel ready for publishing: confirm mode if requested, and
    /// the exchange declared.
    async fn open(&self) -> Result<ChannelHandle> {
        let channel = self.connection.open_channel().await?;
        match self.prepare(&channel).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, channel: &ChannelHandle) -> Result<()> {
        if self.confirms {
            channel.enable_confirms().await?;
        }
        channel.declare_exchange(&self.exchange).await
    }
}

#[async_trait]
impl ChangeNotifier for EventPublisher {
    async fn notify_change(&self, payload: Bytes) -> Result<()> {
        self.publish(payload).await
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, QueueBinding};

    async fn setup(retries: u32) -> (InMemoryBroker, Arc<ConnectionManager>, EventPublisher) {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionManager::from_broker(Arc::new(broker.clone())));
        let publisher =
            EventPublisher::new(connection.clone(), ExchangeDescriptor::default(), false, retries)
                .await
                .unwrap();
        (broker, connection, publisher)
    }

    async fn bind(connection: &ConnectionManager, queue: &str) {
        let channel = connection.open_channel().await.unwrap();
        QueueBinding::new(queue, ExchangeDescriptor::default())
            .declare(&channel)
            .await
            .unwrap();
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_declares_exchange() {
        let (broker, _connection, publisher) = setup(0).await;
        assert!(broker.exchange_exists("logs"));
        assert_eq!(publisher.exchange().name, "logs");
    }

    #[tokio::test]
    async fn test_publish_without_consumers_succeeds() {
        let (_broker, _connection, publisher) = setup(0).await;
        publisher.publish("holiday:1 created").await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_queue() {
        let (broker, connection, publisher) = setup(0).await;
        bind(&connection, "repl1-holiday").await;

        publisher.publish("colab:42 updated").await.unwrap();

        let queued = broker.queued_payloads("repl1-holiday");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].as_str(), Some("colab:42 updated"));
    }

    #[tokio::test]
    async fn test_publish_recovers_after_connection_loss() {
        let (broker, connection, publisher) = setup(1).await;
        bind(&connection, "repl1-holiday").await;

        broker.disconnect();
        publisher.publish("after reconnect").await.unwrap();

        assert_eq!(broker.ready_count("repl1-holiday"), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_when_broker_unreachable() {
        let (broker, _connection, publisher) = setup(1).await;
        broker.disconnect();
        broker.set_available(false);

        let result = publisher.publish("lost").await;
        assert!(matches!(result, Err(BusError::Publish(_))));

        broker.set_available(true);
        publisher.publish("back").await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let (_broker, connection, publisher) = setup(0).await;
        connection.shutdown().await.unwrap();

        let result = publisher.notify_change(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(BusError::Publish(_))));
    }

    #[tokio::test]
    async fn test_confirm_mode_publish() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionManager::from_broker(Arc::new(broker.clone())));
        let publisher =
            EventPublisher::new(connection, ExchangeDescriptor::default(), true, 0)
                .await
                .unwrap();
        publisher.publish("confirmed").await.unwrap();
    }
}
