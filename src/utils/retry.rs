//! Backoff builders for the bus.
//!
//! Every retry in the crate goes through `backon`. These functions hold the
//! standard delays so publishers, consumers and startup agree on them.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Upper bound between resubscribe attempts of a consumer.
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// In-place retries of a transiently failing change handler.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: `max_retries` (0 means the first failure is final)
/// - Jitter enabled
pub fn handler_backoff(max_retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_retries as usize)
        .with_jitter()
}

/// Publish retries, each on a fresh channel.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn publish_backoff(max_retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_retries as usize)
        .with_jitter()
}

/// Broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn connection_backoff(max_retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries as usize)
        .with_jitter()
}

/// Consumer resubscription after a lost channel or connection.
///
/// Never gives up: a consumer keeps trying for as long as it runs. Delays
/// double from 100ms up to [`RESUBSCRIBE_MAX_DELAY`].
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(RESUBSCRIBE_MAX_DELAY)
        .without_max_times()
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    /// Jitter adds up to one extra base delay on top of the exponential value.
    fn assert_within(delay: Duration, base: Duration) {
        assert!(
            delay >= base && delay <= base * 2,
            "delay {:?} outside [{:?}, {:?}]",
            delay,
            base,
            base * 2
        );
    }

    #[test]
    fn test_handler_backoff_honors_budget() {
        assert_eq!(handler_backoff(3).build().count(), 3);
        assert_eq!(handler_backoff(0).build().count(), 0);
    }

    #[test]
    fn test_handler_backoff_is_capped() {
        for delay in handler_backoff(10).build() {
            assert!(delay <= Duration::from_secs(4), "delay {:?} too long", delay);
        }
    }

    #[test]
    fn test_connection_backoff_honors_budget() {
        assert_eq!(connection_backoff(5).build().count(), 5);
    }

    #[test]
    fn test_publish_backoff_starts_small() {
        let first = publish_backoff(2).build().next().unwrap();
        assert_within(first, Duration::from_millis(50));
    }

    #[test]
    fn test_resubscribe_backoff_grows_to_cap_and_never_ends() {
        let delays: Vec<Duration> = resubscribe_backoff().build().take(20).collect();
        assert_eq!(delays.len(), 20);

        for (attempt, delay) in delays.iter().enumerate() {
            let base = Duration::from_millis(100)
                .saturating_mul(1 << attempt)
                .min(RESUBSCRIBE_MAX_DELAY);
            assert_within(*delay, base);
        }
        // 100ms doubled nine times passes the cap.
        assert!(delays[3] < RESUBSCRIBE_MAX_DELAY);
        assert!(delays[12..].iter().all(|d| *d >= RESUBSCRIBE_MAX_DELAY));
    }
}
