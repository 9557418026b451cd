//! In-process broker for standalone mode and tests.
//!
//! Models the parts of AMQP the notification layer relies on: fanout and
//! direct exchanges, named queues with FIFO order, per-channel unacked
//! tracking, requeue on channel close and dead-letter routing on reject.
//! Everything lives in one process, so it only connects replicas that share
//! the same `InMemoryBroker`.
//!
//! `disconnect` simulates a dropped connection: every open channel and
//! delivery stream fails, unacked messages go back to their queues, and new
//! channels can be opened right away.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerChannel, BusError, ChangeEvent, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeDescriptor, ExchangeKind, QueueSpec, Result,
};

#[derive(Clone)]
struct Message {
    event: ChangeEvent,
    redelivered: bool,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    /// delivery tag -> (channel id, message)
    unacked: HashMap<u64, (u64, Message)>,
    notify: Arc<Notify>,
}

impl Queue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Put every unacked message held by `channel` back at the head of the
    /// queue, oldest first, flagged as redelivered.
    fn requeue_channel(&mut self, channel: Option<u64>) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| channel.map_or(true, |id| *owner == id))
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            return;
        }
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some((_, mut message)) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    /// Bumped on every dropped connection; channels from older generations
    /// are dead.
    generation: u64,
    available: bool,
    closed: bool,
    next_tag: u64,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, event: &ChangeEvent) -> Result<usize> {
        let exchange_def = self.exchanges.get(exchange).ok_or_else(|| {
            BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &exchange_def.bindings {
            let matches = match exchange_def.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key == routing_key,
            };
            if matches && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    event: event.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        Ok(targets.len())
    }

    fn release_channel(&mut self, channel: u64) {
        for queue in self.queues.values_mut() {
            queue.requeue_channel(Some(channel));
        }
    }

    fn drop_connection(&mut self) {
        self.generation += 1;
        for queue in self.queues.values_mut() {
            queue.requeue_channel(None);
            queue.notify.notify_waiters();
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    next_channel: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker.
///
/// Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        info!("In-memory broker initialized");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    ..Default::default()
                }),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Drop the current connection. Open channels and consumer streams fail;
    /// unacked messages are requeued.
    pub fn disconnect(&self) {
        self.shared.lock().drop_connection();
        warn!("In-memory broker connection dropped");
    }

    /// Make the broker (un)reachable for new channels.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.lock().queues.contains_key(name)
    }

    /// Queues bound to an exchange, in binding order.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .map(|ex| ex.bindings.iter().map(|(queue, _)| queue.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acked or rejected.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Payloads waiting in a queue, head first.
    pub fn queued_payloads(&self, queue: &str) -> Vec<ChangeEvent> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.event.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let generation = {
            let state = self.shared.lock();
            if state.closed {
                return Err(BusError::Connection("connection closed".to_string()));
            }
            if !state.available {
                return Err(BusError::Connection("broker unavailable".to_string()));
            }
            state.generation
        };

        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            generation,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            state.drop_connection();
        }
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Lock broker state, failing if this channel is no longer usable.
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.shared.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Channel("channel closed".to_string()));
        }
        if state.closed || state.generation != self.generation {
            return Err(BusError::Channel("connection lost".to_string()));
        }
        Ok(state)
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.lock();
        state.release_channel(self.id);
        // Wake consumers of this channel so their streams end.
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    /// Protocol errors close the channel, as a real broker does.
    fn fail(&self, state: &mut BrokerState, error: BusError) -> BusError {
        self.closed.store(true, Ordering::SeqCst);
        state.release_channel(self.id);
        debug!(channel = self.id, error = %error, "In-memory channel closed by error");
        error
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        let mut state = self.live_state()?;
        let mismatch = match state.exchanges.get(&exchange.name) {
            Some(existing) => existing.kind != exchange.kind || existing.durable != exchange.durable,
            None => {
                state.exchanges.insert(
                    exchange.name.clone(),
                    Exchange {
                        kind: exchange.kind,
                        durable: exchange.durable,
                        bindings: Vec::new(),
                    },
                );
                false
            }
        };
        if mismatch {
            let err = BusError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                exchange.name
            ));
            return Err(self.fail(&mut state, err));
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.live_state()?;
        let mismatch = match state.queues.get(&queue.name) {
            Some(existing) => existing.spec != *queue,
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), Queue::new(queue.clone()));
                false
            }
        };
        if mismatch {
            let err = BusError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                queue.name
            ));
            return Err(self.fail(&mut state, err));
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            let err = BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue));
            return Err(self.fail(&mut state, err));
        }
        match state.exchanges.get_mut(exchange) {
            Some(ex) => {
                let binding = (queue.to_string(), routing_key.to_string());
                if !ex.bindings.contains(&binding) {
                    ex.bindings.push(binding);
                }
                Ok(())
            }
            None => {
                let err = BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange));
                Err(self.fail(&mut state, err))
            }
        }
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.live_state().map(|_| ())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Streams hand out the next delivery only when polled, so a consumer
        // that settles before polling again never holds more than one.
        self.live_state().map(|_| ())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, event: &ChangeEvent) -> Result<()> {
        let mut state = self.live_state()?;
        match state.route(exchange, routing_key, event) {
            Ok(count) => {
                debug!(exchange, queues = count, "Routed in-memory message");
                Ok(())
            }
            Err(e) => Err(self.fail(&mut state, e)),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            let err = BusError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue));
            return Err(self.fail(&mut state, err));
        }
        drop(state);

        debug!(queue, consumer_tag, "In-memory consumer registered");

        let cursor = Cursor {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            channel: self.id,
            generation: self.generation,
            closed: self.closed.clone(),
        };

        Ok(stream::unfold(Some(cursor), |cursor| async move {
            let Some(cursor) = cursor else {
                return None;
            };
            match cursor.next_delivery().await {
                Some(Ok(delivery)) => Some((Ok(delivery), Some(cursor))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        })
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.shared.lock();
        !self.closed.load(Ordering::SeqCst) && !state.closed && state.generation == self.generation
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read position of one consumer on one queue.
struct Cursor {
    shared: Arc<Shared>,
    queue: String,
    channel: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

enum Poll {
    Ready(Option<Result<Delivery>>),
    Pending(Arc<Notify>),
}

impl Cursor {
    async fn next_delivery(&self) -> Option<Result<Delivery>> {
        loop {
            let notify = match self.poll() {
                Poll::Ready(item) => return item,
                Poll::Pending(notify) => notify,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a publish in between is not lost.
            if let Poll::Ready(item) = self.poll() {
                return item;
            }
            notified.await;
        }
    }

    fn poll(&self) -> Poll {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.closed || state.generation != self.generation {
            return Poll::Ready(Some(Err(BusError::Channel("connection lost".to_string()))));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        let tag = state.next_tag;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Poll::Ready(Some(Err(BusError::Channel(format!(
                "queue '{}' deleted",
                self.queue
            )))));
        };

        match queue.ready.pop_front() {
            Some(message) => {
                queue.unacked.insert(tag, (self.channel, message.clone()));
                state.next_tag += 1;
                let acker = MemoryAcker {
                    shared: self.shared.clone(),
                    queue: self.queue.clone(),
                    tag,
                    generation: self.generation,
                };
                Poll::Ready(Some(Ok(Delivery::new(
                    message.event,
                    message.redelivered,
                    Box::new(acker),
                ))))
            }
            None => Poll::Pending(queue.notify.clone()),
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    generation: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(QueueSpec, Message, MutexGuard<'_, BrokerState>)> {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return Err(BusError::Channel(
                "connection lost before delivery was settled".to_string(),
            ));
        }
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Channel(format!("queue '{}' deleted", self.queue)))?;
        let (_, message) = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BusError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
        })?;
        let spec = queue.spec.clone();
        Ok((spec, message, state))
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle().map(|_| ())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let (spec, mut message, mut state) = self.settle()?;

        if requeue {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                message.redelivered = true;
                queue.ready.push_front(message);
                queue.notify.notify_waiters();
            }
            return Ok(());
        }

        match spec.dead_letter {
            Some(target) => {
                let routed = state.route(&target.exchange, &target.routing_key, &message.event);
                match routed {
                    Ok(count) => debug!(queue = %self.queue, dead_letter_queues = count, "Dead-lettered message"),
                    Err(e) => warn!(queue = %self.queue, error = %e, "Dead-letter exchange missing, message dropped"),
                }
            }
            None => debug!(queue = %self.queue, "Rejected message dropped"),
        }
        Ok(())
    }
}
