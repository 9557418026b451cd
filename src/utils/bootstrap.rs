//! Bootstrap utilities for the replica binary.
//!
//! Shared initialization code: tracing setup and connect-with-retry.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the HOLIDAY_LOG environment variable.
///
/// Defaults to "info" level if HOLIDAY_LOG is not set. Set
/// HOLIDAY_LOG_FORMAT=json for structured output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect to a service with exponential backoff and jitter.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "broker")
/// * `address` - The address being connected to, for logging
/// * `max_retries` - Retries after the first attempt
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    max_retries: u32,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = connection_backoff(max_retries).build();

    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                tracing::info!(
                    service = %service_name,
                    address = %address,
                    attempt,
                    "Connected"
                );
                return Ok(client);
            }
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(
                        service = %service_name,
                        address = %address,
                        attempt,
                        max_retries,
                        error = %e,
                        delay_ms = %delay.as_millis(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        service = %service_name,
                        address = %address,
                        attempts = attempt,
                        error = %e,
                        "Giving up connecting"
                    );
                    return Err(e);
                }
            },
        }
    }
}
