//! Change handlers: the registration point for the CRUD/service layer.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::bus::ChangeEvent;

/// A handler failure.
///
/// Transient failures (e.g. a cache that is briefly unreachable) are retried
/// in place; permanent ones go straight to the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    transient: bool,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Handler for change events consumed from a queue.
///
/// Invoked once per delivery, one delivery at a time per queue. The message
/// is acknowledged only after the returned future resolves to `Ok`.
pub trait ChangeHandler: Send + Sync {
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Adapter turning an async closure into a `ChangeHandler`.
pub struct FnHandler<F>(F);

impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.0)(event).boxed()
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let handler = handler_fn(|event| async move {
///     cache.invalidate(event.payload()).await;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

/// Handler that only logs what it receives.
pub struct LogHandler {
    domain: &'static str,
}

impl LogHandler {
    pub fn new(domain: &'static str) -> Self {
        Self { domain }
    }
}

impl ChangeHandler for LogHandler {
    fn handle(&self, event: ChangeEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        let domain = self.domain;
        Box::pin(async move {
            info!(
                domain,
                payload = event.as_str().unwrap_or("<binary>"),
                bytes = event.payload().len(),
                produced_at = %event.produced_at(),
                "Change received"
            );
            Ok(())
        })
    }
}
