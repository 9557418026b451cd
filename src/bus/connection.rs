//! Process-wide broker connection.
//!
//! One `ConnectionManager` owns the single broker connection of a replica.
//! Publisher and consumers never see the connection itself; each of them
//! derives its own `ChannelHandle` through `open_channel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    Broker, BrokerChannel, BusError, ChangeEvent, DeliveryStream, ExchangeDescriptor, QueueSpec,
    Result,
};
#[cfg(feature = "amqp")]
use crate::config::BrokerConfig;

/// Owner of the process-wide broker connection.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Connect to RabbitMQ.
    ///
    /// Validates the broker settings, then retries with exponential backoff
    /// up to `connect_retries` times before giving up. A failure here is
    /// fatal: the replica cannot do its notification duties without a broker.
    #[cfg(feature = "amqp")]
    pub async fn open(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;

        let broker = crate::utils::bootstrap::connect_with_retry(
            "broker",
            &config.hostname,
            config.connect_retries,
            || super::amqp::AmqpBroker::connect(config),
        )
        .await?;

        Ok(Self::from_broker(Arc::new(broker)))
    }

    /// Wrap an already connected broker.
    pub fn from_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }

    /// Derive a new channel from the shared connection.
    pub async fn open_channel(&self) -> Result<ChannelHandle> {
        if self.is_closed() {
            return Err(BusError::Connection("Connection is shut down".to_string()));
        }

        let channel = self.broker.open_channel().await?;
        debug!("Opened broker channel");
        Ok(ChannelHandle { inner: channel })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Idempotent; later `open_channel` calls fail.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.broker.close().await {
            Ok(()) => {
                info!("Broker connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to close broker connection cleanly");
                Err(e)
            }
        }
    }
}

impl Drop for ConnectionManager {
    /// Release the connection if `shutdown` was never called. The close runs
    /// on the current runtime; without one the broker notices the dropped
    /// socket instead.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let broker = self.broker.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                match broker.close().await {
                    Ok(()) => debug!("Broker connection released on drop"),
                    Err(e) => debug!(error = %e, "Failed to release broker connection on drop"),
                }
            });
        }
    }
}

/// A channel owned by exactly one publisher or consumer.
pub struct ChannelHandle {
    inner: Box<dyn BrokerChannel>,
}

impl ChannelHandle {
    pub async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        self.inner.declare_exchange(exchange).await
    }

    pub async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.inner.declare_queue(queue).await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    pub async fn enable_confirms(&self) -> Result<()> {
        self.inner.enable_confirms().await
    }

    pub async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner.set_prefetch(count).await
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, event: &ChangeEvent) -> Result<()> {
        self.inner.publish(exchange, routing_key, event).await
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.inner.consume(queue, consumer_tag).await
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the channel. Unacknowledged deliveries go back to their queues.
    pub async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}
