use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use kt_common::amount::FixedPointAmount;
use kt_common::config::AppConfig;
use kt_common::error::AmountError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("Balance did not rise above {initial} after {iterations} polls")]
    Timeout {
        initial: FixedPointAmount,
        iterations: u32,
    },

    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// Detects bridge arrivals by polling a balance until it grows.
///
/// A bridge transfer finalizes on the destination ledger some time after the
/// source submission finalizes, so the only reliable completion signal is the
/// destination balance itself.
#[derive(Debug, Clone, Copy)]
pub struct BalanceWatcher {
    max_iterations: u32,
    interval: Duration,
}

impl BalanceWatcher {
    pub fn new(max_iterations: u32, interval: Duration) -> Self {
        Self {
            max_iterations,
            interval,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.watcher_max_iterations,
            Duration::from_millis(config.watcher_interval_ms),
        )
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Poll until the balance strictly exceeds `initial`, returning the delta.
    ///
    /// Polls at most `max_iterations` times and sleeps between polls only. A
    /// failed read is logged and counts as an iteration without change.
    pub async fn wait_for_change<F, Fut, E>(
        &self,
        initial: FixedPointAmount,
        mut poll: F,
    ) -> Result<FixedPointAmount, WatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<FixedPointAmount, E>>,
        E: std::fmt::Display,
    {
        for iteration in 1..=self.max_iterations {
            match poll().await {
                Ok(current) if current > initial => {
                    let delta = current.checked_sub(initial)?;
                    tracing::debug!(
                        iteration,
                        initial = %initial,
                        current = %current,
                        delta = %delta,
                        "Balance change observed"
                    );
                    return Ok(delta);
                }
                Ok(current) => {
                    tracing::debug!(
                        iteration,
                        max_iterations = self.max_iterations,
                        current = %current,
                        "Balance unchanged"
                    );
                }
                Err(e) => {
                    tracing::warn!(iteration, error = %e, "Balance poll failed");
                }
            }

            if iteration < self.max_iterations {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(WatchError::Timeout {
            initial,
            iterations: self.max_iterations,
        })
    }
}

impl Default for BalanceWatcher {
    fn default() -> Self {
        Self::new(12, Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rust_decimal_macros::dec;

    fn amt(value: rust_decimal::Decimal) -> FixedPointAmount {
        FixedPointAmount::from(value)
    }

    /// Poll function replaying `values`, repeating the last one forever.
    fn replay(
        values: Vec<Result<FixedPointAmount, String>>,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<Result<FixedPointAmount, String>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let value = values[n.min(values.len() - 1)].clone();
            std::future::ready(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_exact_delta() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poll = replay(
            vec![Ok(amt(dec!(100))), Ok(amt(dec!(100))), Ok(amt(dec!(105)))],
            calls.clone(),
        );

        let delta = BalanceWatcher::default()
            .wait_for_change(amt(dec!(100)), poll)
            .await
            .unwrap();

        assert_eq!(delta, amt(dec!(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_max_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poll = replay(vec![Ok(amt(dec!(100)))], calls.clone());
        let started = tokio::time::Instant::now();

        let result = BalanceWatcher::default()
            .wait_for_change(amt(dec!(100)), poll)
            .await;

        assert_eq!(
            result,
            Err(WatchError::Timeout {
                initial: amt(dec!(100)),
                iterations: 12
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        // eleven sleeps between twelve polls
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(11) && elapsed < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_is_not_a_change() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poll = replay(vec![Ok(amt(dec!(90)))], calls.clone());

        let result = BalanceWatcher::new(3, Duration::from_millis(10))
            .wait_for_change(amt(dec!(100)), poll)
            .await;

        assert!(matches!(result, Err(WatchError::Timeout { iterations: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_counts_as_iteration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poll = replay(
            vec![
                Err("connection reset".to_string()),
                Ok(amt(dec!(100))),
                Ok(amt(dec!(100.25))),
            ],
            calls.clone(),
        );

        let delta = BalanceWatcher::new(3, Duration::from_millis(10))
            .wait_for_change(amt(dec!(100)), poll)
            .await
            .unwrap();

        assert_eq!(delta, amt(dec!(0.25)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_iterations_times_out_without_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poll = replay(vec![Ok(amt(dec!(500)))], calls.clone());

        let result = BalanceWatcher::new(0, Duration::from_millis(10))
            .wait_for_change(amt(dec!(100)), poll)
            .await;

        assert!(matches!(result, Err(WatchError::Timeout { iterations: 0, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
