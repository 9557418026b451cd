//! AMQP (RabbitMQ) broker implementation.
//!
//! The replica keeps a single AMQP connection in a deadpool pool of size
//! one. A connection the broker dropped fails its health check on the next
//! checkout and is replaced, so `open_channel` after a connection loss
//! reconnects transparently.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    Broker, BrokerChannel, BusError, ChangeEvent, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeDescriptor, ExchangeKind, QueueSpec, Result, CONTENT_TYPE,
};
use crate::config::BrokerConfig;

/// Name the connection shows under in the RabbitMQ management UI.
const CONNECTION_NAME: &str = "holiday-replica";

/// Queue argument naming the dead-letter exchange.
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead-letter routing key.
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// RabbitMQ broker connection.
pub struct AmqpBroker {
    pool: Pool,
}

impl AmqpBroker {
    /// Connect to RabbitMQ. Fails if the first connection cannot be made.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let properties =
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());
        let manager = Manager::new(config.amqp_uri(), properties);
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(
            host = %config.hostname,
            port = config.port,
            vhost = %config.vhost,
            "Connected to AMQP"
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(format!("Failed to create channel: {}", e)))?;

        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        let result = match self.pool.get().await {
            Ok(conn) => conn
                .close(200, "replica shutdown")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e))),
            Err(e) => Err(BusError::Connection(format!(
                "Failed to get connection from pool: {}",
                e
            ))),
        };
        self.pool.close();
        result
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(target) = &queue.dead_letter {
        args.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(target.exchange.as_str())),
        );
        args.insert(
            ShortString::from(DEAD_LETTER_ROUTING_KEY_ARG),
            AMQPValue::LongString(LongString::from(target.routing_key.as_str())),
        );
    }
    args
}

fn message_properties(event: &ChangeEvent) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_timestamp(event.produced_at().timestamp().max(0) as u64)
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let produced_at = (*delivery.properties.timestamp())
        .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
        .unwrap_or_else(Utc::now);

    let event = ChangeEvent::new(delivery.data).with_produced_at(produced_at);
    Delivery::new(
        event,
        delivery.redelivered,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Channel(format!("Failed to declare exchange '{}': {}", exchange.name, e))
            })
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                BusError::Channel(format!("Failed to declare queue '{}': {}", queue.name, e))
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Channel(format!(
                    "Failed to bind queue '{}' to '{}': {}",
                    queue, exchange, e
                ))
            })
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("Failed to enable confirms: {}", e)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, event: &ChangeEvent) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                event.payload(),
                message_properties(event),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        // Resolves immediately unless the channel is in confirm mode.
        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Failed to get publish confirmation: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BusError::Publish("Broker rejected the message".to_string()));
        }

        debug!(exchange, bytes = event.payload().len(), "Published to AMQP");
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| BusError::Channel(format!("Consumer delivery error: {}", e)))
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "channel released")
            .await
            .map_err(|e| BusError::Channel(format!("Failed to close channel: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Channel(format!("Failed to reject: {}", e)))
    }
}
