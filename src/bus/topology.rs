//! Broker topology: the fanout exchange and the queues bound to it.
//!
//! Every replica binds its own queues to one fanout exchange, so each
//! published change reaches every queue. Fanout ignores routing keys; queues
//! are bound with an empty key.
//!
//! ## Dead letters
//!
//! A queue with dead-lettering enabled is declared with a dead-letter
//! exchange `{exchange}.dlx` (direct) and routing key equal to the queue
//! name. The matching dead-letter queue `{queue}.dlq` is bound to that
//! exchange with the same key, so rejected messages from one queue never
//! land in another queue's dead letters.

use tracing::debug;

use super::{ChannelHandle, Result};

/// Exchange name for change notifications.
pub const EXCHANGE_NAME: &str = "logs";

/// Suffix of the per-exchange dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = ".dlx";

/// Suffix of the per-queue dead-letter queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Copies every message to every bound queue.
    Fanout,
    /// Routes to queues whose binding key equals the routing key.
    Direct,
}

/// An exchange to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDescriptor {
    /// A fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: false,
        }
    }

    /// The dead-letter exchange paired with this exchange.
    pub fn dead_letter(&self) -> Self {
        Self {
            name: format!("{}{}", self.name, DEAD_LETTER_EXCHANGE_SUFFIX),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

impl Default for ExchangeDescriptor {
    fn default() -> Self {
        Self::fanout(EXCHANGE_NAME)
    }
}

/// Where a queue sends rejected messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// A queue to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            dead_letter: None,
        }
    }
}

/// A queue bound to the change exchange.
///
/// Declared once when a consumer is configured, redeclared (idempotently)
/// whenever the consumer resubscribes, and never deleted by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: ExchangeDescriptor,
    pub durable: bool,
    pub dead_letter: bool,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, exchange: ExchangeDescriptor) -> Self {
        Self {
            queue: queue.into(),
            exchange,
            durable: true,
            dead_letter: false,
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Name of the dead-letter queue, when dead-lettering is enabled.
    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter
            .then(|| format!("{}{}", self.queue, DEAD_LETTER_QUEUE_SUFFIX))
    }

    /// The queue declaration, including its dead-letter arguments.
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: self.durable,
            dead_letter: self.dead_letter.then(|| DeadLetterTarget {
                exchange: self.exchange.dead_letter().name,
                routing_key: self.queue.clone(),
            }),
        }
    }

    /// Declare the exchange, the queue (and its dead-letter pair) and bind
    /// them. Safe to call repeatedly.
    pub async fn declare(&self, channel: &ChannelHandle) -> Result<()> {
        channel.declare_exchange(&self.exchange).await?;

        if let Some(dlq) = self.dead_letter_queue() {
            let dlx = self.exchange.dead_letter();
            channel.declare_exchange(&dlx).await?;
            channel.declare_queue(&QueueSpec::new(&dlq, true)).await?;
            channel.bind_queue(&dlq, &dlx.name, &self.queue).await?;
        }

        channel.declare_queue(&self.queue_spec()).await?;
        channel.bind_queue(&self.queue, &self.exchange.name, "").await?;

        debug!(
            queue = %self.queue,
            exchange = %self.exchange.name,
            dead_letter = self.dead_letter,
            "Declared queue binding"
        );

        Ok(())
    }
}
