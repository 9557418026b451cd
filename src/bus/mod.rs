//! Broker plumbing for change notifications.
//!
//! This module contains:
//! - `Broker` / `BrokerChannel` traits: the connection and channel seams
//! - `ChangeEvent` and `Delivery`: what flows over the exchange
//! - Topology, connection manager and publisher
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{BrokerBackend, BrokerConfig, ConfigError, MessagingConfig};
use crate::consumer::HandlerError;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
#[cfg(feature = "memory")]
pub mod memory;
pub mod publisher;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use connection::{ChannelHandle, ConnectionManager};
#[cfg(feature = "memory")]
pub use memory::InMemoryBroker;
pub use publisher::{ChangeNotifier, EventPublisher};
pub use topology::{
    DeadLetterTarget, ExchangeDescriptor, ExchangeKind, QueueBinding, QueueSpec, EXCHANGE_NAME,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker cannot be reached. Fatal at startup.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Channel-level protocol fault. The owner recreates its channel.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Lifecycle misuse, e.g. configuring a queue after consuming started.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

// ============================================================================
// Messages
// ============================================================================

/// Content type stamped on published change notifications.
pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// A change notification.
///
/// The payload is opaque to the bus; in the holiday service it is a UTF-8
/// association string identifying the changed entity. Events carry no id and
/// are never deduplicated, so handlers must be idempotent if they care.
#[derive(Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    payload: Bytes,
    produced_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an event stamped with the current time.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            produced_at: Utc::now(),
        }
    }

    /// Override the production timestamp (used when decoding deliveries).
    pub fn with_produced_at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = produced_at;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ChangeEvent");
        match self.as_str() {
            Some(text) => s.field("payload", &text),
            None => s.field("payload_len", &self.payload.len()),
        };
        s.field("produced_at", &self.produced_at).finish()
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery. With `requeue` the broker redelivers it,
    /// otherwise it is dead-lettered (if the queue has a target) or dropped.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message delivered from a queue, pending acknowledgment.
pub struct Delivery {
    event: ChangeEvent,
    redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(event: ChangeEvent, redelivered: bool, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            event,
            redelivered,
            acker,
        }
    }

    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    /// True when the broker delivered this message before without an ack.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one consumer. An `Err` item means the channel
/// or connection failed; the stream yields nothing useful afterwards.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// A broker connection. Only hands out channels; the raw connection never
/// leaves the implementation.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0-9-1
/// - `InMemoryBroker`: in-process exchange and queues
#[async_trait]
pub trait Broker: Send + Sync {
    /// Derive a new, independent channel from the connection.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Close the connection. Channels derived from it stop working.
    async fn close(&self) -> Result<()>;
}

/// A lightweight session multiplexed over a broker connection.
///
/// Channels are never shared between a publisher and a consumer, or between
/// two consumers, so acknowledgment state cannot cross-talk.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Redeclaring with identical parameters is a no-op.
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()>;

    /// Declare a queue. Redeclaring with identical parameters is a no-op.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Put the channel in confirm mode so publishes wait for the broker's ack.
    async fn enable_confirms(&self) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish an event to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, event: &ChangeEvent) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

// ============================================================================
// Factory
// ============================================================================

/// Open the process-wide broker connection based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp` (included in default)
/// - Memory: `--features memory` (included in default)
pub async fn init_connection(
    messaging: &MessagingConfig,
    broker: &BrokerConfig,
) -> Result<Arc<ConnectionManager>> {
    match messaging.backend {
        BrokerBackend::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let connection = ConnectionManager::open(broker).await?;
                info!(backend = "amqp", host = %broker.hostname, "Broker connection initialized");
                Ok(Arc::new(connection))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = broker;
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        BrokerBackend::Memory => {
            #[cfg(feature = "memory")]
            {
                let _ = broker;
                info!(backend = "memory", "Broker connection initialized");
                Ok(Arc::new(ConnectionManager::from_broker(Arc::new(
                    InMemoryBroker::new(),
                ))))
            }

            #[cfg(not(feature = "memory"))]
            {
                let _ = broker;
                Err(BusError::Connection(
                    "In-memory broker requires the 'memory' feature. Rebuild with --features memory"
                        .to_string(),
                ))
            }
        }
    }
}
