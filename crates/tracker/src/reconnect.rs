//! Exponential-backoff reconnection policy.
//!
//! [`ReconnectConfig`] defines the backoff curve, [`ReconnectBudget`]
//! bounds how many times a progress channel may be re-opened before
//! tracking falls back to polling, and [`reconnect_loop`] keeps retrying
//! an arbitrary connect future (used for the notification channel)
//! until it succeeds or the [`CancellationToken`] fires.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Reconnects allowed before a progress channel gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            multiplier: 1.5,
            max_attempts: 20,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect number `attempt` (0-based):
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Counts reconnects for one progress channel.
///
/// The counter never exceeds `max`. [`reset`](Self::reset) is called on
/// every successful open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBudget {
    attempts: u32,
    max: u32,
}

impl ReconnectBudget {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Reconnects consumed since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Consume one attempt, returning the 0-based index of the attempt
    /// just taken, or `None` if the budget is already spent.
    pub fn consume(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        let attempt = self.attempts;
        self.attempts += 1;
        Some(attempt)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Keep calling `connect` with exponential backoff until it succeeds.
///
/// Unlike progress channels this loop has no attempt limit. Returns
/// `Some(connection)` once a connection succeeds, or `None` if `cancel`
/// is triggered first.
pub async fn reconnect_loop<T, E, F, Fut>(
    target: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    mut connect: F,
) -> Option<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;

    loop {
        let delay = config.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tracing::info!(target_url = target, attempt, "Connecting");

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(target_url = target, "Reconnect cancelled");
                return None;
            }
            result = connect() => {
                match result {
                    Ok(conn) => {
                        tracing::info!(target_url = target, attempt, "Connected");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            target_url = target,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Connect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn first_delay_is_initial_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(30));
    }

    #[test]
    fn delay_grows_by_multiplier() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(45));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs_f64(67.5));
    }

    #[test]
    fn delay_clamps_at_max() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(19), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(2),
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(6));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(54));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(60));
    }

    #[test]
    fn budget_never_exceeds_max() {
        let mut budget = ReconnectBudget::new(3);
        assert_eq!(budget.consume(), Some(0));
        assert_eq!(budget.consume(), Some(1));
        assert_eq!(budget.consume(), Some(2));
        assert!(budget.is_exhausted());
        assert_eq!(budget.consume(), None);
        assert_eq!(budget.attempts(), 3);
    }

    #[test]
    fn budget_reset_restores_attempts() {
        let mut budget = ReconnectBudget::new(2);
        budget.consume();
        budget.consume();
        budget.reset();
        assert_eq!(budget.attempts(), 0);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        let mut budget = ReconnectBudget::new(0);
        assert!(budget.is_exhausted());
        assert_eq!(budget.consume(), None);
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Option<()> = reconnect_loop(
            "ws://localhost:9999",
            &ReconnectConfig::default(),
            &cancel,
            || async { Err::<(), _>("refused") },
        )
        .await;

        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_retries_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = reconnect_loop("ws://test", &ReconnectConfig::default(), &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
