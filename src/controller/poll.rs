//! Cluster-state polling.
//!
//! A poll repeatedly evaluates a predicate against live cluster state at a
//! fixed interval until the predicate reports completion, a fatal error, too
//! many consecutive transient errors, or the timeout elapses.
//!
//! ```text
//! Waiting ──Done──────────────▶ Succeeded
//!    │  ───Fatal─────────────▶ Failed(fatal)
//!    │  ───Transient > limit──▶ Failed(escalated)
//!    │  ───elapsed ≥ timeout──▶ Failed(timed out)
//!    └──NotDone / Transient──▶ Waiting
//! ```
//!
//! The clock is injectable so waits can be driven deterministically in tests.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Result of one predicate evaluation.
#[derive(Debug)]
pub enum PollOutcome {
    /// Condition not reached yet, keep polling.
    NotDone,
    /// Condition reached.
    Done,
    /// Unrecoverable condition, stop polling.
    Fatal(String),
    /// Observation failed (e.g. an API read error), keep polling.
    Transient(String),
}

/// Timing and escalation policy for a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPreset {
    /// Delay between predicate evaluations.
    pub interval: Duration,
    /// Maximum time spent polling.
    pub timeout: Duration,
    /// Consecutive transient failures tolerated before giving up.
    /// `None` retries transient failures until the timeout.
    pub weird_failures_threshold: Option<u32>,
}

impl PollPreset {
    /// Routine scale-up/scale-down waits.
    pub const SHORT: PollPreset = PollPreset {
        interval: Duration::from_secs(20),
        timeout: Duration::from_secs(180),
        weird_failures_threshold: None,
    };

    /// Queue drain waits against the RabbitMQ management API.
    pub const DRAIN: PollPreset = PollPreset {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
        weird_failures_threshold: None,
    };

    /// Database migrations, which may legitimately take a long time.
    pub const EXTENDED: PollPreset = PollPreset {
        interval: Duration::from_secs(10),
        timeout: Duration::from_secs(3600),
        weird_failures_threshold: Some(10),
    };
}

/// Terminal failure of a poll.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("timed out after {elapsed:?} (last observation: {last_observation})")]
    TimedOut {
        elapsed: Duration,
        last_observation: String,
    },

    #[error("{0}")]
    Fatal(String),

    #[error("giving up after {failures} consecutive failures, last: {last_error}")]
    Escalated { failures: u32, last_error: String },
}

/// Source of time for polls.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only advances when slept on.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Time elapsed on this clock since creation.
    pub fn elapsed(&self) -> Duration {
        self.offset.lock().map(|o| *o).unwrap_or_default()
    }

    /// Move the clock forward without sleeping.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Poll `predicate` until it succeeds or the preset's limits are hit.
///
/// The predicate runs immediately, then once per interval. Timeout is checked
/// after each evaluation, so a poll that never completes fails once the
/// elapsed time reaches the timeout, at most one interval late.
pub async fn poll<F, Fut>(
    clock: &dyn Clock,
    preset: PollPreset,
    what: &str,
    mut predicate: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome>,
{
    let started = clock.now();
    let mut consecutive_failures: u32 = 0;
    let mut last_observation = String::from("none");

    loop {
        match predicate().await {
            PollOutcome::Done => {
                debug!(what, elapsed = ?clock.now().duration_since(started), "Wait completed");
                return Ok(());
            }
            PollOutcome::Fatal(reason) => {
                warn!(what, reason = %reason, "Wait aborted");
                return Err(PollError::Fatal(reason));
            }
            PollOutcome::NotDone => {
                consecutive_failures = 0;
                last_observation = String::from("not ready");
            }
            PollOutcome::Transient(reason) => {
                if let Some(threshold) = preset.weird_failures_threshold {
                    consecutive_failures += 1;
                    if consecutive_failures > threshold {
                        warn!(
                            what,
                            failures = consecutive_failures,
                            error = %reason,
                            "Too many consecutive failures, giving up"
                        );
                        return Err(PollError::Escalated {
                            failures: consecutive_failures,
                            last_error: reason,
                        });
                    }
                }
                debug!(what, error = %reason, "Transient failure while waiting");
                last_observation = reason;
            }
        }

        let elapsed = clock.now().duration_since(started);
        if elapsed >= preset.timeout {
            warn!(what, ?elapsed, "Wait timed out");
            return Err(PollError::TimedOut {
                elapsed,
                last_observation,
            });
        }

        clock.sleep(preset.interval).await;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn preset(interval: u64, timeout: u64, threshold: Option<u32>) -> PollPreset {
        PollPreset {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
            weird_failures_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn test_done_on_first_call() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = poll(&clock, PollPreset::SHORT, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::Done }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_times_out_exactly_at_timeout() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = poll(&clock, preset(20, 180, None), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::NotDone }
        })
        .await;

        match result {
            Err(PollError::TimedOut { elapsed, .. }) => {
                assert_eq!(elapsed, Duration::from_secs(180));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        // t = 0, 20, ..., 180
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_timeout_late_by_less_than_one_interval() {
        let clock = ManualClock::new();

        let result = poll(&clock, preset(20, 50, None), "test", || async {
            PollOutcome::NotDone
        })
        .await;

        match result {
            Err(PollError::TimedOut { elapsed, .. }) => {
                assert!(elapsed >= Duration::from_secs(50));
                assert!(elapsed < Duration::from_secs(50 + 20));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = poll(&clock, PollPreset::EXTENDED, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    PollOutcome::NotDone
                } else {
                    PollOutcome::Fatal("crash loop".to_string())
                }
            }
        })
        .await;

        assert_eq!(result, Err(PollError::Fatal("crash loop".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_escalates_on_threshold_plus_one() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = poll(&clock, preset(10, 3600, Some(10)), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { PollOutcome::Transient("404".to_string()) }
        })
        .await;

        assert!(matches!(
            result,
            Err(PollError::Escalated { failures: 11, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_threshold_transients_then_success() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = poll(&clock, preset(10, 3600, Some(10)), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 10 {
                    PollOutcome::Transient("404".to_string())
                } else {
                    PollOutcome::Done
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_not_done_resets_failure_count() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        // 2 failures, 1 not-done, 2 failures, done: never exceeds threshold 2
        let result = poll(&clock, preset(1, 3600, Some(2)), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 | 1 | 3 | 4 => PollOutcome::Transient("lookup failed".to_string()),
                    2 => PollOutcome::NotDone,
                    _ => PollOutcome::Done,
                }
            }
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_transients_without_threshold_run_until_timeout() {
        let clock = ManualClock::new();

        let result = poll(&clock, PollPreset::DRAIN, "test", || async {
            PollOutcome::Transient("connection refused".to_string())
        })
        .await;

        match result {
            Err(PollError::TimedOut {
                last_observation, ..
            }) => assert_eq!(last_observation, "connection refused"),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleeps_between_calls() {
        let clock = TokioClock;
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = poll(&clock, preset(5, 60, None), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    PollOutcome::NotDone
                } else {
                    PollOutcome::Done
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }
}
