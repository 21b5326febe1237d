//! Failure backoff for a single upstream stream.
//!
//! # State machine
//!
//! ```text
//! Closed --[consecutive failures >= threshold]--> Open(until = now + pause)
//! Open   --[first is_open() query at/after until]--> Closed (counter = 0)
//! Any    --[record_success() / reset()]--> Closed (counter = 0)
//! ```
//!
//! Failures recorded while open are counted but never extend the pause.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use redline_core::Slug;

/// Configuration for a [`FailureBackoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Consecutive failures that open the backoff (at least 1).
    pub threshold: u32,
    /// How long the stream stays paused once open.
    pub pause: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            pause: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

#[derive(Debug, Default)]
struct BackoffInner {
    consecutive_failures: u32,
    paused_until: Option<DateTime<Utc>>,
}

impl BackoffInner {
    fn clear(&mut self) {
        self.consecutive_failures = 0;
        self.paused_until = None;
    }
}

/// Status view of a [`FailureBackoff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffSnapshot {
    pub stream: Slug,
    pub consecutive_failures: u32,
    pub paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub pause_secs: u64,
}

/// Consecutive-failure counter with a timed pause.
///
/// Interior mutability via `Mutex`; share it by reference or `Arc`.
#[derive(Debug)]
pub struct FailureBackoff {
    stream: Slug,
    config: BackoffConfig,
    inner: Mutex<BackoffInner>,
}

impl FailureBackoff {
    pub fn new(stream: Slug, config: BackoffConfig) -> Self {
        let config = BackoffConfig {
            threshold: config.threshold.max(1),
            ..config
        };
        Self {
            stream,
            config,
            inner: Mutex::new(BackoffInner::default()),
        }
    }

    pub fn stream(&self) -> &Slug {
        &self.stream
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BackoffInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the stream is paused right now.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }

    /// `is_open` against an explicit clock.
    ///
    /// The first query at or after the pause deadline closes the backoff and
    /// zeroes the counter.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.paused_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.expire(&mut inner);
                false
            }
            None => false,
        }
    }

    /// Count one failure. Returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        self.record_failure_at(Utc::now())
    }

    pub fn record_failure_at(&self, now: DateTime<Utc>) -> u32 {
        let mut inner = self.lock();
        if inner.paused_until.is_some_and(|until| now >= until) {
            self.expire(&mut inner);
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let failures = inner.consecutive_failures;
        warn!(
            stream = %self.stream,
            failures,
            threshold = self.config.threshold,
            "upstream failure recorded"
        );

        if failures >= self.config.threshold && inner.paused_until.is_none() {
            let until = self.pause_deadline(now);
            inner.paused_until = Some(until);
            warn!(
                stream = %self.stream,
                failures,
                paused_until = %until,
                "too many consecutive failures, pausing stream"
            );
        }
        failures
    }

    /// A successful call closes the backoff and zeroes the counter.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.consecutive_failures > 0 || inner.paused_until.is_some() {
            info!(stream = %self.stream, "stream healthy again");
        }
        inner.clear();
    }

    /// Administrative force-clear.
    pub fn reset(&self) {
        self.lock().clear();
        info!(stream = %self.stream, "failure count reset");
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Read-only view; an expired pause is reported as not paused but is only
    /// cleared by the next `is_open` query.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> BackoffSnapshot {
        let inner = self.lock();
        BackoffSnapshot {
            stream: self.stream.clone(),
            consecutive_failures: inner.consecutive_failures,
            paused: inner.paused_until.is_some_and(|until| now < until),
            paused_until: inner.paused_until,
            threshold: self.config.threshold,
            pause_secs: self.config.pause.as_secs(),
        }
    }

    fn expire(&self, inner: &mut BackoffInner) {
        inner.clear();
        info!(stream = %self.stream, "pause expired, resuming stream");
    }

    fn pause_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.pause)
            .ok()
            .and_then(|pause| now.checked_add_signed(pause))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
