//! # Cached Time Service
//!
//! A millisecond wall clock read on the hot path without a system call. A
//! periodic task refreshes it every `timerServiceGranularity`, so readings
//! are at most one granularity stale.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn system_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// # Cached Clock
#[derive(Debug)]
pub struct CachedClock {
    millis: AtomicU64,
}

impl CachedClock {
    /// A clock primed with the current time.
    pub fn new() -> Self {
        Self::fixed(system_millis())
    }

    /// A clock reading `millis` until the first refresh.
    pub fn fixed(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Re-reads the system clock and returns the new value.
    pub fn refresh(&self) -> u64 {
        let now = system_millis();
        self.millis.store(now, Ordering::Relaxed);
        now
    }

    /// The cached time in milliseconds since the Unix epoch.
    pub fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }

    /// Milliseconds from `earlier_ms` to the cached time, 0 if it lies ahead.
    pub fn elapsed_since(&self, earlier_ms: u64) -> u64 {
        self.now_millis().saturating_sub(earlier_ms)
    }
}

impl Default for CachedClock {
    fn default() -> Self {
        Self::new()
    }
}
