//! Reusable retry and circuit-breaker policies.
//!
//! The broker transport uses the retry policy for reconnect backoff, the
//! coordinator for template-declared task retries. Worker nodes put a
//! breaker around their operations.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use hive_core::config::{BreakerSettings, RetrySettings};
use hive_core::{HiveError, Result};

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. 0 = unlimited.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub factor: f64,
    pub max_backoff: Duration,
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            factor: s.backoff_factor.max(1.0),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(63) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * exp;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts == 0 || attempts_made < self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Only transport errors and timeouts retry.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if is_retryable(&e) && self.allows(attempt + 1) => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(what, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(e: &HiveError) -> bool {
    matches!(e, HiveError::Transport(_) | HiveError::Timeout { .. })
}

// ── Circuit breaker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Recent call outcomes while closed. `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Error-rate circuit breaker.
///
/// Closed: calls pass and outcomes fill a sliding window. Once the window
/// holds `min_requests` outcomes and the failure fraction reaches the
/// threshold the breaker opens. Open: calls get the fallback until
/// `reset_timeout` has passed, then a single trial call is let through
/// (half-open). A successful trial closes the breaker, a failed one re-opens
/// it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.reset_timeout_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) if at.elapsed() >= self.reset_timeout() => {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Ask permission for one call.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let ready = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout())
                    .unwrap_or(true);
                if ready {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(breaker = %self.name, "circuit half-open, probing");
                }
                ready
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`try_acquire`](Self::try_acquire).
    pub fn record(&self, success: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                if success {
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    tracing::info!(breaker = %self.name, "circuit closed");
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(breaker = %self.name, "trial call failed, circuit re-opened");
                }
            }
            BreakerState::Closed => {
                inner.window.push_back(!success);
                while inner.window.len() > self.settings.window_size.max(1) {
                    inner.window.pop_front();
                }
                let total = inner.window.len();
                let failures = inner.window.iter().filter(|f| **f).count();
                if total >= self.settings.min_requests
                    && failures as f64 / total as f64 >= self.settings.error_rate_threshold
                {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.window.clear();
                    tracing::warn!(breaker = %self.name, failures, total, "circuit opened");
                }
            }
            // Late result from a call admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }

    /// Run `op` through the breaker. While open, `fallback` is served instead.
    pub async fn call<T, Fut, FB>(&self, op: Fut, fallback: FB) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> Result<T>,
    {
        if !self.try_acquire() {
            tracing::debug!(breaker = %self.name, "circuit open, serving fallback");
            return fallback();
        }
        let result = op.await;
        self.record(result.is_ok());
        result
    }
}
