//! Retry utilities: backoff builders for catalog watches.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::WatchBackoffConfig;

/// Backoff for catalog watch loops.
///
/// - Min delay: 500ms
/// - Max delay: 60s
/// - Max attempts: 30
/// - Jitter enabled
pub fn watch_backoff(config: &WatchBackoffConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_attempts)
        .with_jitter()
}

/// Consecutive-failure tracker for a long-running watch.
///
/// A success resets the schedule; once the schedule is exhausted
/// [`WatchRetry::next_delay`] returns `None` and the watch should give up.
pub struct WatchRetry {
    builder: ExponentialBuilder,
    current: Option<ExponentialBackoff>,
}

impl WatchRetry {
    pub fn new(builder: ExponentialBuilder) -> Self {
        Self {
            builder,
            current: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let builder = &self.builder;
        self.current
            .get_or_insert_with(|| builder.clone().build())
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: usize) -> WatchBackoffConfig {
        WatchBackoffConfig {
            min_delay_ms: 1,
            max_delay_ms: 4,
            max_attempts,
        }
    }

    #[test]
    fn test_watch_retry_exhausts_after_max_attempts() {
        let mut retry = WatchRetry::new(watch_backoff(&config(3)));
        assert!(retry.next_delay().is_some());
        assert!(retry.next_delay().is_some());
        assert!(retry.next_delay().is_some());
        assert!(retry.next_delay().is_none());
    }

    #[test]
    fn test_watch_retry_reset_restarts_schedule() {
        let mut retry = WatchRetry::new(watch_backoff(&config(1)));
        assert!(retry.next_delay().is_some());
        assert!(retry.next_delay().is_none());

        retry.reset();
        assert!(retry.next_delay().is_some());
    }

    #[test]
    fn test_delays_stay_under_jittered_cap() {
        let mut retry = WatchRetry::new(watch_backoff(&config(10)));
        while let Some(delay) = retry.next_delay() {
            assert!(delay <= Duration::from_millis(8));
        }
    }
}
