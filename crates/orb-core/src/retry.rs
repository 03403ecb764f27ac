//! Bounded retry with exponential backoff, and per-dependency backoff state.

use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Bounded retry policy: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retry.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds or attempts run out.
    ///
    /// Returns the final result and the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> (Result<T, E>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt + 1),
                Err(e) if attempt + 1 < self.max_attempts => {
                    let backoff = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt + 1),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(4))
    }
}

#[derive(Debug, Clone, Default)]
struct HealthState {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    announced: bool,
}

/// Tracks consecutive failures per named dependency and opens a backoff
/// window once `failure_threshold` is reached. One success resets it.
#[derive(Debug)]
pub struct DependencyHealth {
    failure_threshold: u32,
    backoff: Duration,
    states: DashMap<String, HealthState>,
}

impl DependencyHealth {
    pub fn new(failure_threshold: u32, backoff: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            backoff,
            states: DashMap::new(),
        }
    }

    pub fn record_success(&self, dependency: &str) {
        if let Some(mut state) = self.states.get_mut(dependency) {
            if state.consecutive_failures > 0 {
                info!(dependency, "Dependency recovered");
            }
            *state = HealthState::default();
        }
    }

    pub fn record_failure(&self, dependency: &str) {
        let mut state = self.states.entry(dependency.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold && state.backoff_until.is_none() {
            state.backoff_until = Some(Instant::now() + self.backoff);
            state.announced = false;
        }
    }

    /// Whether calls to `dependency` should be skipped right now.
    ///
    /// Logs once per backoff window.
    pub fn is_backing_off(&self, dependency: &str) -> bool {
        let Some(mut state) = self.states.get_mut(dependency) else {
            return false;
        };
        match state.backoff_until {
            Some(until) if Instant::now() < until => {
                if !state.announced {
                    warn!(
                        dependency,
                        failures = state.consecutive_failures,
                        backoff_secs = self.backoff.as_secs(),
                        "Dependency unhealthy, backing off"
                    );
                    state.announced = true;
                }
                true
            }
            Some(_) => {
                // Window elapsed: allow a probe, re-open on the next failure.
                state.backoff_until = None;
                state.consecutive_failures = self.failure_threshold.saturating_sub(1);
                false
            }
            None => false,
        }
    }

    pub fn consecutive_failures(&self, dependency: &str) -> u32 {
        self.states
            .get(dependency)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_once_then_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let (result, attempts) = policy
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_on_retry() {
        let policy = RetryPolicy::default();
        let (result, attempts) = policy
            .run("op", |attempt| async move {
                if attempt == 0 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_opens_and_closes() {
        let health = DependencyHealth::new(2, Duration::from_secs(60));
        health.record_failure("broker");
        assert!(!health.is_backing_off("broker"));
        health.record_failure("broker");
        assert!(health.is_backing_off("broker"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!health.is_backing_off("broker"));

        health.record_success("broker");
        assert_eq!(health.consecutive_failures("broker"), 0);
        assert!(!health.is_backing_off("market_data"));
    }
}
