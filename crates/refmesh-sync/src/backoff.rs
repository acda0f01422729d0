//! Bounded exponential backoff.
//!
//! The schedule starts at `initial_interval`, multiplies by `multiplier` after
//! every attempt (capped at `max_interval`), and stops once the time elapsed
//! since the first attempt exceeds `max_elapsed`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// Backoff tuning, in the shape it takes in the server config file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Total retry budget. 0 retries forever.
    pub max_elapsed_ms: u64,
    /// Jitter as a fraction of the current interval. 0 keeps the schedule
    /// deterministic.
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_elapsed_ms: 60_000,
            randomization_factor: 0.0,
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms))
    }

    /// Reject settings that cannot produce a usable schedule.
    pub fn validate(&self) -> SyncResult<()> {
        if self.initial_interval_ms == 0 {
            return Err(SyncError::InvalidBackoff("initial_interval_ms must be positive".into()));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(SyncError::InvalidBackoff(format!(
                "max_interval_ms {} is below initial_interval_ms {}",
                self.max_interval_ms, self.initial_interval_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SyncError::InvalidBackoff(format!(
                "multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(SyncError::InvalidBackoff(format!(
                "randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            )));
        }
        Ok(())
    }
}

/// Source of the current time for measuring the retry budget.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, so paused test runtimes control it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct ExponentialBackoff<C = TokioClock> {
    config: BackoffConfig,
    current: Duration,
    start: Instant,
    clock: C,
}

impl ExponentialBackoff<TokioClock> {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_clock(config, TokioClock)
    }
}

impl<C: Clock> ExponentialBackoff<C> {
    pub fn with_clock(config: BackoffConfig, clock: C) -> Self {
        let start = clock.now();
        Self {
            current: config.initial_interval(),
            config,
            start,
            clock,
        }
    }

    /// Restart the schedule and the elapsed-time budget.
    pub fn reset(&mut self) {
        self.current = self.config.initial_interval();
        self.start = self.clock.now();
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    /// Delay before the next attempt, or `None` once the time elapsed since
    /// the first attempt exceeds the budget.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(budget) = self.config.max_elapsed() {
            if self.elapsed() > budget {
                return None;
            }
        }
        let next = self.randomized(self.current);
        self.advance();
        Some(next)
    }

    fn advance(&mut self) {
        let max = self.config.max_interval();
        let grown = self.current.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = clamped_secs(grown, max);
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization_factor.min(1.0);
        if factor <= 0.0 {
            return interval;
        }
        let delta = interval.as_secs_f64() * factor;
        let lo = interval.as_secs_f64() - delta;
        let hi = interval.as_secs_f64() + delta;
        let picked = rand::thread_rng().gen_range(lo..=hi);
        clamped_secs(picked, interval.saturating_add(interval))
    }
}

/// `secs` as a `Duration`, never above `max`. Non-finite values map to `max`.
fn clamped_secs(secs: f64, max: Duration) -> Duration {
    if secs.is_finite() && secs < max.as_secs_f64() {
        Duration::from_secs_f64(secs.max(0.0))
    } else {
        max
    }
}

/// Why [`retry_notify`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The cancellation token fired.
    Cancelled,
    /// The budget ran out; carries the last attempt's error.
    Exhausted(E),
}

/// Run `op` until it succeeds, sleeping per `backoff` between attempts.
///
/// `notify` sees every failed attempt that will be retried, with the delay
/// before the retry. Cancellation is checked before every attempt and aborts
/// both in-flight attempts and sleeps.
pub async fn retry_notify<C, T, E, F, Fut, N>(
    backoff: &mut ExponentialBackoff<C>,
    cancel: &CancellationToken,
    mut op: F,
    mut notify: N,
) -> Result<T, RetryError<E>>
where
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Duration),
{
    backoff.reset();
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let err = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            },
        };
        let Some(delay) = backoff.next_backoff() else {
            return Err(RetryError::Exhausted(err));
        };
        notify(&err, delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
