//! Refresh counters

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, PoisonError,
};

use serde::Serialize;
use tokenward_clock::UnixTime;

/// A point-in-time view of refresh activity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Refresh exchanges started
    pub attempted: u64,
    /// Refresh exchanges that produced new tokens
    pub succeeded: u64,
    /// Refresh exchanges that failed, terminally or after exhausting retries
    pub failed: u64,
    /// When the last successful refresh completed
    pub last_refresh: Option<UnixTime>,
    /// When the background loop will next check for due tokens
    pub next_scheduled_check: Option<UnixTime>,
}

#[derive(Debug, Default)]
struct Times {
    last_refresh: Option<UnixTime>,
    next_scheduled_check: Option<UnixTime>,
}

/// Shared refresh counters
#[derive(Debug, Default)]
pub struct RefreshStats {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    times: Mutex<Times>,
}

impl RefreshStats {
    pub(crate) fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, at: UnixTime) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refresh = Some(at);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn schedule_next(&self, at: Option<UnixTime>) {
        self.times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_scheduled_check = at;
    }

    /// A snapshot of the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let times = self.times.lock().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_refresh: times.last_refresh,
            next_scheduled_check: times.next_scheduled_check,
        }
    }
}
