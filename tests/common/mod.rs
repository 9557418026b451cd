//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use holiday_bus::bus::ChangeEvent;
use holiday_bus::config::Config;
use holiday_bus::consumer::{ChangeHandler, HandlerError};

/// Config with three replicas, defaulting to Repl1.
pub fn three_replica_config() -> Config {
    let mut config = Config::for_test();
    for (i, name) in ["Repl1", "Repl2", "Repl3"].iter().enumerate() {
        config
            .queues
            .insert(name.to_string(), name.to_lowercase());
        config
            .ports
            .insert(name.to_string(), (5011 + i).to_string());
    }
    config
        .connection_strings
        .insert("replicaName".to_string(), "Repl1".to_string());
    config
}

/// Handler that records payloads, optionally failing on one of them.
#[derive(Clone, Default)]
pub struct Recorder {
    payloads: Arc<RwLock<Vec<String>>>,
    poison: Option<String>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail permanently on `payload`, recording everything else.
    pub fn failing_on(payload: &str) -> Self {
        Self {
            payloads: Arc::default(),
            poison: Some(payload.to_string()),
        }
    }

    /// Wait until at least `count` payloads arrived, or two seconds passed.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.payloads.read().await.len() < count && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.payloads.read().await.clone()
    }
}

impl ChangeHandler for Recorder {
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        let payloads = self.payloads.clone();
        let payload = event.as_str().unwrap_or_default().to_string();
        let poisoned = self.poison.as_deref() == Some(payload.as_str());
        Box::pin(async move {
            if poisoned {
                return Err(HandlerError::permanent(format!("cannot handle '{}'", payload)));
            }
            payloads.write().await.push(payload);
            Ok(())
        })
    }
}
