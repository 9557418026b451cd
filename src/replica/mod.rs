//! Replica host.
//!
//! Runs the startup sequence of one holiday-service replica against an open
//! broker connection: build the publisher, then for every registered
//! consumer domain configure its queue and start consuming. Consumers start
//! in registration order; if one fails, the ones already running are stopped
//! and the error is returned.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{ChangeNotifier, ConnectionManager, EventPublisher, Result};
use crate::config::{MessagingConfig, ReplicaConfig};
use crate::consumer::{
    ChangeHandler, ConsumerController, ConsumerDomain, ConsumerSettings, QueueConsumer,
};

/// Collects handlers before the host starts.
pub struct ReplicaHostBuilder {
    replica: ReplicaConfig,
    messaging: MessagingConfig,
    handlers: Vec<(ConsumerDomain, Arc<dyn ChangeHandler>)>,
}

impl ReplicaHostBuilder {
    pub fn new(replica: ReplicaConfig, messaging: MessagingConfig) -> Self {
        Self {
            replica,
            messaging,
            handlers: Vec::new(),
        }
    }

    /// Handle holiday changes.
    pub fn on_holiday_change(self, handler: impl ChangeHandler + 'static) -> Self {
        self.with_handler(ConsumerDomain::Holiday, Arc::new(handler))
    }

    /// Handle colaborator-id changes.
    pub fn on_colaborator_id_change(self, handler: impl ChangeHandler + 'static) -> Self {
        self.with_handler(ConsumerDomain::ColaboratorId, Arc::new(handler))
    }

    /// Register the handler for a domain, replacing any earlier one. One
    /// domain has one queue, so two handlers would compete for messages.
    pub fn with_handler(mut self, domain: ConsumerDomain, handler: Arc<dyn ChangeHandler>) -> Self {
        match self.handlers.iter_mut().find(|(d, _)| *d == domain) {
            Some(entry) => {
                warn!(domain = %domain, "Replacing previously registered handler");
                entry.1 = handler;
            }
            None => self.handlers.push((domain, handler)),
        }
        self
    }

    /// Build the publisher and start every registered consumer.
    pub async fn start(self, connection: Arc<ConnectionManager>) -> Result<ReplicaHost> {
        let publisher =
            Arc::new(EventPublisher::from_messaging(connection.clone(), &self.messaging).await?);
        let settings = ConsumerSettings::from_messaging(&self.messaging);

        let mut controllers: Vec<Arc<dyn ConsumerController>> = Vec::new();
        for (domain, handler) in self.handlers {
            let controller: Arc<dyn ConsumerController> = Arc::new(QueueConsumer::new(
                domain,
                connection.clone(),
                settings.clone(),
                handler,
            ));
            let queue = self.replica.queue_for(domain);

            let started = match controller.config_queue(&queue).await {
                Ok(()) => controller.start_consuming().await,
                Err(e) => Err(e),
            };

            if let Err(e) = started {
                error!(domain = %domain, queue = %queue, error = %e, "Failed to start consumer");
                let _ = controller.stop().await;
                stop_all(&controllers).await;
                let _ = publisher.close().await;
                return Err(e);
            }
            controllers.push(controller);
        }

        info!(
            replica = %self.replica.replica_name,
            port = self.replica.port,
            consumers = controllers.len(),
            "Replica host started"
        );

        Ok(ReplicaHost {
            replica: self.replica,
            connection,
            publisher,
            controllers,
        })
    }
}

/// A running replica: one publisher plus one consumer per domain.
pub struct ReplicaHost {
    replica: ReplicaConfig,
    connection: Arc<ConnectionManager>,
    publisher: Arc<EventPublisher>,
    controllers: Vec<Arc<dyn ConsumerController>>,
}

impl ReplicaHost {
    pub fn builder(replica: ReplicaConfig, messaging: MessagingConfig) -> ReplicaHostBuilder {
        ReplicaHostBuilder::new(replica, messaging)
    }

    pub fn replica(&self) -> &ReplicaConfig {
        &self.replica
    }

    pub fn publisher(&self) -> Arc<EventPublisher> {
        self.publisher.clone()
    }

    /// The hook handed to the CRUD layer.
    pub fn notifier(&self) -> Arc<dyn ChangeNotifier> {
        self.publisher.clone()
    }

    pub fn controller(&self, domain: ConsumerDomain) -> Option<Arc<dyn ConsumerController>> {
        self.controllers
            .iter()
            .find(|c| c.domain() == domain)
            .cloned()
    }

    /// Stop consumers, release the publisher channel and close the
    /// connection.
    pub async fn shutdown(self) -> Result<()> {
        info!(replica = %self.replica.replica_name, "Shutting down replica host");
        stop_all(&self.controllers).await;
        if let Err(e) = self.publisher.close().await {
            warn!(error = %e, "Failed to close publisher channel");
        }
        self.connection.shutdown().await
    }
}

async fn stop_all(controllers: &[Arc<dyn ConsumerController>]) {
    for controller in controllers.iter().rev() {
        if let Err(e) = controller.stop().await {
            warn!(domain = %controller.domain(), error = %e, "Failed to stop consumer");
        }
    }
}
