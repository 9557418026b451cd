//! Test utilities and handler doubles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::bus::{ChangeEvent, ConnectionManager, InMemoryBroker};
use crate::consumer::{ChangeHandler, HandlerError};

/// Connection manager over a fresh in-memory broker.
pub fn memory_connection() -> (InMemoryBroker, Arc<ConnectionManager>) {
    let broker = InMemoryBroker::new();
    let connection = Arc::new(ConnectionManager::from_broker(Arc::new(broker.clone())));
    (broker, connection)
}

/// Handler that records every event it sees.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<RwLock<Vec<ChangeEvent>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().await.clone()
    }

    pub async fn payloads(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .map(|e| e.as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Wait until at least `count` events arrived, or one second passed.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while self.events.read().await.len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.payloads().await
    }
}

impl ChangeHandler for RecordingHandler {
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        let events = self.events.clone();
        Box::pin(async move {
            events.write().await.push(event);
            Ok(())
        })
    }
}

/// Handler that fails a fixed number of times before recording successes.
#[derive(Clone)]
pub struct FailingHandler {
    failures: u32,
    transient: bool,
    calls: Arc<AtomicU32>,
    recorder: RecordingHandler,
}

impl FailingHandler {
    pub fn transient(failures: u32) -> Self {
        Self::new(failures, true)
    }

    pub fn permanent(failures: u32) -> Self {
        Self::new(failures, false)
    }

    fn new(failures: u32, transient: bool) -> Self {
        Self {
            failures,
            transient,
            calls: Arc::new(AtomicU32::new(0)),
            recorder: RecordingHandler::new(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorder(&self) -> &RecordingHandler {
        &self.recorder
    }
}

impl ChangeHandler for FailingHandler {
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            let err = if self.transient {
                HandlerError::transient(format!("failure {}", call + 1))
            } else {
                HandlerError::permanent(format!("failure {}", call + 1))
            };
            return Box::pin(async move { Err(err) });
        }
        self.recorder.handle(event)
    }
}
