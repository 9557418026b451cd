//! Consumer controllers.
//!
//! A replica runs one controller per consumer domain. Each controller owns
//! its queue (bound to the fanout exchange), its own channel and its
//! handler. Lifecycle:
//!
//! ```text
//! Unconfigured --config_queue--> Configured --start_consuming--> Consuming
//!                                     |                              |
//!                                     +------------stop--------------+--> Stopped
//! ```
//!
//! While consuming, a background task pulls deliveries one at a time,
//! invokes the handler, and acks on success. A transiently failing handler is
//! retried in place; once retries run out (or on a permanent failure) the
//! delivery is rejected without requeue, which sends it to the queue's
//! dead-letter queue. A lost channel or connection triggers resubscription
//! with exponential backoff; nothing a handler does can stop the loop.

mod handler;

pub use handler::{handler_fn, ChangeHandler, FnHandler, HandlerError, LogHandler};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::{
    BusError, ChannelHandle, ConnectionManager, Delivery, DeliveryStream, ExchangeDescriptor,
    QueueBinding, Result,
};
use crate::config::{ConfigError, MessagingConfig};
use crate::utils::retry::{resubscribe_backoff, RESUBSCRIBE_MAX_DELAY};

/// Kind of entity a consumer tracks changes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerDomain {
    Holiday,
    ColaboratorId,
}

impl ConsumerDomain {
    pub const ALL: [ConsumerDomain; 2] = [ConsumerDomain::Holiday, ConsumerDomain::ColaboratorId];

    pub fn name(&self) -> &'static str {
        match self {
            ConsumerDomain::Holiday => "holiday",
            ConsumerDomain::ColaboratorId => "colaborator-id",
        }
    }

    /// Suffix appended to the replica's base queue name.
    pub fn queue_suffix(&self) -> &'static str {
        match self {
            ConsumerDomain::Holiday => "holiday",
            ConsumerDomain::ColaboratorId => "colab",
        }
    }
}

impl fmt::Display for ConsumerDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unconfigured,
    Configured,
    Consuming,
    Stopped,
}

/// Per-domain consumer controller.
#[async_trait]
pub trait ConsumerController: Send + Sync {
    fn domain(&self) -> ConsumerDomain;

    async fn state(&self) -> ConsumerState;

    /// Declare the exchange and `queue_name`, and bind them. Allowed until
    /// consuming starts; calling again rebinds to the new queue.
    async fn config_queue(&self, queue_name: &str) -> Result<()>;

    /// Start delivering messages to the handler. Requires a configured
    /// queue. A second call while consuming is a no-op.
    async fn start_consuming(&self) -> Result<()>;

    /// Stop consuming and release the channel. The in-flight message, if
    /// any, finishes first. Terminal.
    async fn stop(&self) -> Result<()>;
}

/// Settings shared by every consumer of a replica.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub exchange: ExchangeDescriptor,
    pub durable: bool,
    pub dead_letter: bool,
    pub prefetch: u16,
    /// Delays between in-place handler retries; its length is the retry
    /// budget.
    pub handler_retry: ExponentialBuilder,
}

impl ConsumerSettings {
    pub fn from_messaging(messaging: &MessagingConfig) -> Self {
        Self {
            exchange: messaging.exchange_descriptor(),
            durable: messaging.durable_queues,
            dead_letter: messaging.dead_letter,
            prefetch: messaging.prefetch.max(1),
            handler_retry: messaging.handler_retry(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from_messaging(&MessagingConfig::default())
    }
}

struct ConsumerInner {
    state: ConsumerState,
    binding: Option<QueueBinding>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Queue-backed consumer controller.
pub struct QueueConsumer {
    domain: ConsumerDomain,
    connection: Arc<ConnectionManager>,
    settings: ConsumerSettings,
    handler: Arc<dyn ChangeHandler>,
    inner: Mutex<ConsumerInner>,
}

impl QueueConsumer {
    pub fn new(
        domain: ConsumerDomain,
        connection: Arc<ConnectionManager>,
        settings: ConsumerSettings,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            domain,
            connection,
            settings,
            handler,
            inner: Mutex::new(ConsumerInner {
                state: ConsumerState::Unconfigured,
                binding: None,
                cancel: None,
                task: None,
            }),
        }
    }

    /// Controller for holiday changes.
    pub fn holiday(
        connection: Arc<ConnectionManager>,
        settings: ConsumerSettings,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self::new(ConsumerDomain::Holiday, connection, settings, handler)
    }

    /// Controller for colaborator-id changes.
    pub fn colaborator_id(
        connection: Arc<ConnectionManager>,
        settings: ConsumerSettings,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self::new(ConsumerDomain::ColaboratorId, connection, settings, handler)
    }

    /// The configured queue, if any.
    pub async fn queue_name(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .binding
            .as_ref()
            .map(|binding| binding.queue.clone())
    }
}

#[async_trait]
impl ConsumerController for QueueConsumer {
    fn domain(&self) -> ConsumerDomain {
        self.domain
    }

    async fn state(&self) -> ConsumerState {
        self.inner.lock().await.state
    }

    async fn config_queue(&self, queue_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ConsumerState::Unconfigured | ConsumerState::Configured => {}
            state => {
                return Err(BusError::InvalidState(format!(
                    "{} consumer cannot configure queue '{}' while {:?}",
                    self.domain, queue_name, state
                )))
            }
        }
        if queue_name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName(self.domain.to_string()).into());
        }

        let binding = QueueBinding::new(queue_name, self.settings.exchange.clone())
            .with_durable(self.settings.durable)
            .with_dead_letter(self.settings.dead_letter);

        let channel = self.connection.open_channel().await?;
        let declared = binding.declare(&channel).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close setup channel");
        }
        declared?;

        info!(
            domain = %self.domain,
            queue = %binding.queue,
            exchange = %binding.exchange.name,
            "Consumer queue configured"
        );

        inner.binding = Some(binding);
        inner.state = ConsumerState::Configured;
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let binding = match (inner.state, inner.binding.as_ref()) {
            (ConsumerState::Consuming, _) => {
                debug!(domain = %self.domain, "Consumer already running");
                return Ok(());
            }
            (ConsumerState::Configured, Some(binding)) => binding.clone(),
            (state, _) => {
                return Err(BusError::InvalidState(format!(
                    "{} consumer cannot start while {:?}; call config_queue first",
                    self.domain, state
                )))
            }
        };

        let worker = ConsumerLoop {
            domain: self.domain,
            connection: self.connection.clone(),
            consumer_tag: format!("{}-{}", binding.queue, Uuid::new_v4()),
            binding,
            prefetch: self.settings.prefetch,
            retry: self.settings.handler_retry,
            handler: self.handler.clone(),
        };

        // The first subscription happens here so startup failures reach the
        // caller instead of a background log line.
        let subscription = worker.subscribe().await?;

        let span = info_span!("consumer", domain = %self.domain, queue = %worker.binding.queue);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(subscription, cancel_rx).instrument(span));

        inner.cancel = Some(cancel_tx);
        inner.task = Some(task);
        inner.state = ConsumerState::Consuming;
        info!(domain = %self.domain, "Consumer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(task) = inner.task.take() {
            if let Err(e) = task.await {
                error!(domain = %self.domain, error = %e, "Consumer task failed");
            }
        }
        if inner.state != ConsumerState::Stopped {
            info!(domain = %self.domain, "Consumer stopped");
        }
        inner.state = ConsumerState::Stopped;
        Ok(())
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        if let Some(cancel) = self.inner.get_mut().cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

/// A live channel with an attached consumer.
struct Subscription {
    channel: ChannelHandle,
    deliveries: DeliveryStream,
}

/// Background consume loop of one controller.
struct ConsumerLoop {
    domain: ConsumerDomain,
    connection: Arc<ConnectionManager>,
    binding: QueueBinding,
    consumer_tag: String,
    prefetch: u16,
    retry: ExponentialBuilder,
    handler: Arc<dyn ChangeHandler>,
}

impl ConsumerLoop {
    /// Open a fresh channel, redeclare the topology and attach a consumer.
    async fn subscribe(&self) -> Result<Subscription> {
        let channel = self.connection.open_channel().await?;
        match self.attach(&channel).await {
            Ok(deliveries) => Ok(Subscription {
                channel,
                deliveries,
            }),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn attach(&self, channel: &ChannelHandle) -> Result<DeliveryStream> {
        channel.set_prefetch(self.prefetch).await?;
        self.binding.declare(channel).await?;
        channel
            .consume(&self.binding.queue, &self.consumer_tag)
            .await
    }

    async fn run(self, first: Subscription, mut cancel: watch::Receiver<bool>) {
        let backoff_builder = resubscribe_backoff();
        let mut backoff = backoff_builder.build();
        let mut pending = Some(first);

        loop {
            let Subscription {
                channel,
                mut deliveries,
            } = match pending.take() {
                Some(subscription) => subscription,
                None => match self.subscribe().await {
                    Ok(subscription) => {
                        info!("Consumer resubscribed");
                        backoff = backoff_builder.build();
                        subscription
                    }
                    Err(e) => {
                        let delay = backoff.next().unwrap_or(RESUBSCRIBE_MAX_DELAY);
                        error!(
                            error = %e,
                            backoff_ms = delay.as_millis() as u64,
                            "Failed to resubscribe, retrying after backoff"
                        );
                        if wait_or_cancel(&mut cancel, delay).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            debug!(consumer_tag = %self.consumer_tag, "Consuming");

            let cancelled = loop {
                tokio::select! {
                    biased;
                    _ = cancel.changed() => break true,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => self.process(delivery).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "Consumer channel failed, resubscribing");
                            break false;
                        }
                        None => {
                            warn!("Consumer stream ended, resubscribing");
                            break false;
                        }
                    },
                }
            };

            drop(deliveries);
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close consumer channel");
            }
            if cancelled {
                break;
            }

            let delay = backoff.next().unwrap_or(RESUBSCRIBE_MAX_DELAY);
            if wait_or_cancel(&mut cancel, delay).await {
                break;
            }
        }

        debug!(domain = %self.domain, "Consumer loop exited");
    }

    /// Run the handler for one delivery and settle it.
    async fn process(&self, delivery: Delivery) {
        let mut backoff = self.retry.build();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // handle() itself runs inside the guard: a handler may panic
            // before it returns its future.
            let event = delivery.event().clone();
            let outcome = AssertUnwindSafe(async { self.handler.handle(event).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::permanent("handler panicked")));

            let err = match outcome {
                Ok(()) => {
                    match delivery.ack().await {
                        Ok(()) => debug!("Change handled"),
                        Err(e) => error!(error = %e, "Failed to ack delivery"),
                    }
                    return;
                }
                Err(e) => e,
            };

            let retry_delay = if err.is_transient() {
                backoff.next()
            } else {
                None
            };
            match retry_delay {
                Some(delay) => {
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let err = BusError::Handler(err);
                    error!(
                        error = %err,
                        attempts = attempt,
                        redelivered = delivery.redelivered(),
                        dead_letter = self.binding.dead_letter,
                        "Handler failed, rejecting delivery"
                    );
                    if let Err(e) = delivery.reject(false).await {
                        error!(error = %e, "Failed to reject delivery");
                    }
                    return;
                }
            }
        }
    }
}

/// Sleep for `delay`; returns true if cancellation arrived first.
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *cancel.borrow(),
        _ = cancel.changed() => true,
    }
}
