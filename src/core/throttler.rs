//! Adaptive request throttling.
//!
//! Repeated failures make a job skip some of its upcoming runs instead of
//! hammering the server. Successes pay the debt back one run at a time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::config::LONGEST_ACCEPTABLE_INTERVAL;

/// Failure-driven skip counter shared by one job's runs.
///
/// Counters are atomics so the job loop and out-of-band refreshes can
/// report outcomes concurrently.
#[derive(Debug)]
pub struct Throttler {
    name: String,
    max_skips: i64,
    skips: AtomicI64,
    failures: AtomicI64,
}

impl Throttler {
    /// `interval` is the job's run interval; at most
    /// `LONGEST_ACCEPTABLE_INTERVAL / interval` runs are ever skipped in a row.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        let interval_secs = interval.as_secs().max(1) as i64;
        let longest_secs = LONGEST_ACCEPTABLE_INTERVAL.as_secs() as i64;
        Self {
            name: name.into(),
            max_skips: (longest_secs / interval_secs).max(1),
            skips: AtomicI64::new(0),
            failures: AtomicI64::new(0),
        }
    }

    /// Ceiling for both counters.
    pub fn max_skips(&self) -> i64 {
        self.max_skips
    }

    /// Runs still to be skipped before the next one goes out.
    pub fn skips(&self) -> i64 {
        self.skips.load(Ordering::SeqCst)
    }

    /// Consecutive failures not yet paid back by successes.
    pub fn failures(&self) -> i64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// True when the next scheduled run should go out.
    pub fn perform_action(&self) -> bool {
        self.skips.load(Ordering::SeqCst) <= 0
    }

    /// Records that a run was skipped.
    pub fn skipped(&self) {
        self.skips.fetch_sub(1, Ordering::SeqCst);
    }

    /// Adjusts the backoff from the status of the latest response.
    pub fn handle(&self, status: u16) {
        if (200..400).contains(&status) {
            self.decrement_failure_count_and_reset_skips();
        } else if status >= 400 {
            self.handle_http_error_codes(status);
        }
    }

    /// One success pays back one failure.
    pub fn decrement_failure_count_and_reset_skips(&self) {
        let failures = self.update_failures(|f| (f - 1).max(0));
        self.skips.store(failures, Ordering::SeqCst);
        if failures > 0 {
            debug!("{}: request succeeded, still skipping {} runs", self.name, failures);
        }
    }

    /// Backs off for 401/403/404, 429 and 5xx; other statuses are ignored.
    pub fn handle_http_error_codes(&self, status: u16) {
        match status {
            401 | 403 | 404 => self.handle_not_found_or_unauthorized(status),
            429 => self.handle_backoff("RATE LIMITED", status),
            s if s >= 500 => self.handle_backoff("SERVER ERROR", status),
            _ => debug!("{}: status {} does not affect throttling", self.name, status),
        }
    }

    fn handle_not_found_or_unauthorized(&self, status: u16) {
        error!(
            "{}: server returned {}; check the url and key, backing off to the longest interval",
            self.name, status
        );
        self.skips.store(self.max_skips, Ordering::SeqCst);
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_backoff(&self, reason: &str, status: u16) {
        let max_skips = self.max_skips;
        let failures = self.update_failures(|f| (f + 1).min(max_skips));
        self.skips.store(failures, Ordering::SeqCst);
        warn!(
            "{}: {} ({}), skipping the next {} runs",
            self.name, reason, status, failures
        );
    }

    /// Applies `f` to `failures` atomically and returns the new value.
    fn update_failures(&self, f: impl Fn(i64) -> i64) -> i64 {
        let previous = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| Some(f(current)))
            .unwrap_or_else(|current| current);
        f(previous)
    }
}
