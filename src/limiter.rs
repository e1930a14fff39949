//! Request rate limiter with throttle backoff.
//!
//! Paces outbound provider requests against a requests-per-window
//! budget (trailing window ending "now", not aligned to wall-clock
//! boundaries) and imposes an increasing backoff after throttling
//! responses.
//!
//! ```text
//! acquire()
//!   ├─ backoff active      → sleep until deadline, re-check window
//!   ├─ window saturated    → sleep until oldest timestamp expires
//!   └─ admitted            → record timestamp, return
//! ```
//!
//! All mutable state lives behind one internal mutex; callers only see
//! the atomic operations `acquire`, `record_success`, `record_failure`,
//! and the read-only `snapshot`. Timers use `tokio::time`, so tests can
//! drive the limiter under paused time.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// How backoff grows with consecutive throttle hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial × 2^(hits−1)`
    Exponential,
    /// `initial × hits`
    Linear,
    /// `initial`
    Fixed,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per trailing window.
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: usize,
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Backoff growth strategy.
    #[serde(default = "default_strategy")]
    pub strategy: BackoffStrategy,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_requests_per_window() -> usize {
    50
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_ms: default_window_ms(),
            strategy: default_strategy(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Point-in-time view of limiter state, for observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub requests_in_window: usize,
    pub backoff_remaining_ms: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct LimiterState {
    /// Admission timestamps inside the trailing window, oldest first.
    window: VecDeque<Instant>,
    /// Deadline before which no request may be admitted.
    backoff_until: Option<Instant>,
    /// Consecutive throttle hits since the last success.
    consecutive_failures: u32,
}

impl LimiterState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Paces outbound requests; shared across all workers of a run.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                window: VecDeque::new(),
                backoff_until: None,
                consecutive_failures: 0,
            }),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// Suspend until one request may be issued, then record it.
    ///
    /// Re-checks the window after waking from a backoff sleep, since
    /// the window itself may still be saturated. Only the calling task
    /// suspends; concurrent callers proceed independently.
    pub async fn acquire(&self) {
        loop {
            let now = Instant::now();
            let wait = {
                let mut st = self.state.lock().await;
                st.prune(now, self.window());

                if let Some(until) = st.backoff_until {
                    if until > now {
                        until - now
                    } else {
                        st.backoff_until = None;
                        continue;
                    }
                } else if st.window.len() < self.config.requests_per_window.max(1) {
                    st.window.push_back(now);
                    trace!(in_window = st.window.len(), "request admitted");
                    return;
                } else {
                    // Window saturated: wait for the oldest admission to
                    // fall out of the trailing window.
                    let oldest = *st.window.front().expect("saturated window is non-empty");
                    oldest + self.window() - now
                }
            };
            trace!(wait_ms = wait.as_millis() as u64, "limiter waiting");
            sleep(wait).await;
        }
    }

    /// Record a throttling response from the provider.
    ///
    /// Bumps the consecutive-hit counter, computes the next backoff
    /// delay (taking a provider `Retry-After` hint into account when it
    /// is longer), and arms the backoff deadline. Returns the delay.
    pub async fn record_failure(&self, hint: Option<Duration>) -> Duration {
        let mut st = self.state.lock().await;
        st.consecutive_failures += 1;
        let hits = st.consecutive_failures;

        let computed_ms = match self.config.strategy {
            BackoffStrategy::Exponential => {
                let shift = (hits - 1).min(31);
                self.config.initial_backoff_ms.saturating_mul(1u64 << shift)
            }
            BackoffStrategy::Linear => self.config.initial_backoff_ms.saturating_mul(hits as u64),
            BackoffStrategy::Fixed => self.config.initial_backoff_ms,
        };
        let mut delay = Duration::from_millis(computed_ms.min(self.config.max_backoff_ms));
        if let Some(hint) = hint {
            delay = delay.max(hint);
        }

        st.backoff_until = Some(Instant::now() + delay);
        debug!(
            hits,
            backoff_ms = delay.as_millis() as u64,
            "throttled; backoff armed"
        );
        delay
    }

    /// Record a successful request: clears backoff and the hit counter.
    pub async fn record_success(&self) {
        let mut st = self.state.lock().await;
        st.consecutive_failures = 0;
        st.backoff_until = None;
    }

    /// Read-only snapshot; never mutates limiter state.
    pub async fn snapshot(&self) -> LimiterSnapshot {
        let st = self.state.lock().await;
        let now = Instant::now();
        let window = self.window();
        let requests_in_window = st
            .window
            .iter()
            .filter(|t| now.duration_since(**t) < window)
            .count();
        let backoff_remaining_ms = st
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64)
            .unwrap_or(0);
        LimiterSnapshot {
            requests_in_window,
            backoff_remaining_ms,
            consecutive_failures: st.consecutive_failures,
        }
    }

    /// Forget all window and backoff state. Explicit caller action only.
    pub async fn reset(&self) {
        let mut st = self.state.lock().await;
        st.window.clear();
        st.backoff_until = None;
        st.consecutive_failures = 0;
    }
}
