//! Injectable wall clock.
//!
//! Processing log timestamps come from a [`Clock`] so tests can pin and
//! advance time deterministically.

use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock timestamps.
///
/// Production code uses `RealClock`, tests inject a `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
///
/// Clones share the same time, so a test can hand one clone to a component
/// and advance the other.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the UNIX epoch
    micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Jumps the clock to a specific time, forwards or backwards.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.micros.store(time.timestamp_micros(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or_default()
    }
}
