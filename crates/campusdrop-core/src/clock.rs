// Server-time estimation.
//
// Every consumer that needs "server now" (the poller's liveness check, UI
// countdowns) reads it from one shared `ClockService`. The offset is the
// last server reading minus the local clock at the moment it arrived.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Source of the device's local wall-clock time.
pub trait TimeSource: Send + Sync {
    fn local_now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn local_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualTime {
    millis: AtomicI64,
}

impl ManualTime {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        self.millis.store(t.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: TimeDelta) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn local_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// Offset-corrected clock shared by the whole session.
pub struct ClockService {
    source: Arc<dyn TimeSource>,
    offset_ms: AtomicI64,
    has_reading: AtomicBool,
}

impl ClockService {
    /// Clock backed by the system time with a zero offset.
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemTime))
    }

    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            offset_ms: AtomicI64::new(0),
            has_reading: AtomicBool::new(false),
        }
    }

    /// Record an authoritative server timestamp.
    ///
    /// Last write wins: the new offset replaces the previous one outright.
    pub fn set_server_time(&self, server_time: DateTime<Utc>) {
        let offset = (server_time - self.source.local_now()).num_milliseconds();
        let previous = self.offset_ms.swap(offset, Ordering::Relaxed);
        self.has_reading.store(true, Ordering::Relaxed);
        if previous != offset {
            debug!(offset_ms = offset, previous_ms = previous, "server time offset updated");
        }
    }

    /// Record a coarse server timestamp only if no reading exists yet.
    ///
    /// Used for second-resolution sources (HTTP `Date`) so they never
    /// overwrite a finer push reading. Returns whether it was applied.
    pub fn seed_server_time(&self, server_time: DateTime<Utc>) -> bool {
        if self.has_server_reading() {
            return false;
        }
        self.set_server_time(server_time);
        true
    }

    /// Whether any server timestamp has been recorded.
    pub fn has_server_reading(&self) -> bool {
        self.has_reading.load(Ordering::Relaxed)
    }

    /// Estimated server time: local time plus the current offset.
    pub fn now(&self) -> DateTime<Utc> {
        let local = self.source.local_now();
        local
            .checked_add_signed(TimeDelta::milliseconds(self.offset_ms()))
            .unwrap_or(local)
    }

    /// Uncorrected device time.
    pub fn local_now(&self) -> DateTime<Utc> {
        self.source.local_now()
    }

    /// Current `server - local` offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }
}

impl Default for ClockService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockService")
            .field("offset_ms", &self.offset_ms())
            .finish_non_exhaustive()
    }
}
