//! Wall-clock source for decision and outcome timestamps.
//!
//! The ledger's ordering invariant compares timestamps taken at decision time
//! and at outcome time, so the clock is injectable: production uses
//! [`SystemClock`], tests drive a [`ManualClock`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Stored as nanoseconds since the Unix epoch.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
        }
    }

    /// Move the clock forward by `by` (negative durations are ignored).
    pub fn advance(&self, by: Duration) {
        let step = by.num_nanoseconds().unwrap_or(0).max(0);
        self.nanos.fetch_add(step, Ordering::SeqCst);
    }

    /// Jump to an absolute instant, forwards or backwards.
    pub fn set(&self, at: DateTime<Utc>) {
        self.nanos
            .store(at.timestamp_nanos_opt().unwrap_or(0), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Nanoseconds since the epoch, saturating outside chrono's representable range.
pub(crate) fn nanos(at: &DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Serde adapter storing a `std::time::Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonically() {
        let c = ManualClock::default();
        let t0 = c.now();
        c.advance(Duration::milliseconds(5));
        assert_eq!(c.now() - t0, Duration::milliseconds(5));
        c.advance(Duration::milliseconds(-5));
        assert_eq!(c.now() - t0, Duration::milliseconds(5));
    }
}
