//! Monotonic and wall clocks, plus tenant-local calendar helpers.
//!
//! Pacing and backoff use the monotonic clock; audit records use UTC wall
//! time. Posting windows and day keys are evaluated in the tenant's IANA
//! zone, so a "day" rolls over at the tenant's local midnight.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Time source seam. Implementations must be cheap to call.
pub trait Clock: Send + Sync {
    /// Monotonic offset since an arbitrary epoch. Never decreases.
    fn now_mono(&self) -> Duration;

    /// UTC wall clock.
    fn now_wall(&self) -> DateTime<Utc>;
}

/// Process clock backed by [`Instant`] and [`Utc::now`].
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_mono(&self) -> Duration {
        self.anchor.elapsed()
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic tests.
///
/// `advance` moves the monotonic and wall clocks together, which is what a
/// real process observes over short spans.
pub struct ManualClock {
    inner: Mutex<(Duration, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((Duration::ZERO, wall)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.0 += by;
        inner.1 += ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
    }

    pub fn set_wall(&self, wall: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.1 = wall;
    }
}

impl Clock for ManualClock {
    fn now_mono(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn now_wall(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

/// Tenant-local calendar date, `YYYY-MM-DD` in the tenant's zone.
pub fn day_key(tz: Tz, wall: DateTime<Utc>) -> String {
    wall.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// Local clock hour (0..=23) of `wall` in `tz`.
pub fn local_hour(tz: Tz, wall: DateTime<Utc>) -> u8 {
    wall.with_timezone(&tz).hour() as u8
}

/// Whether `wall` falls inside one of the tenant's posting hours.
pub fn in_posting_window(windows: &BTreeSet<u8>, tz: Tz, wall: DateTime<Utc>) -> bool {
    windows.contains(&local_hour(tz, wall))
}

/// First instant at or after `from` whose local hour is in `windows`.
///
/// Hours are enumerated in UTC and converted per-hour, so a DST jump cannot
/// invent a skipped or doubled local hour: each UTC hour maps to exactly one
/// local hour. Returns `None` for an empty window set or if nothing opens
/// within the scan horizon (8 days covers every weekly pattern).
pub fn next_window_open(
    windows: &BTreeSet<u8>,
    tz: Tz,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if windows.is_empty() {
        return None;
    }
    if windows.contains(&local_hour(tz, from)) {
        return Some(from);
    }
    // Round up to the next UTC hour boundary, then step hour by hour.
    let mut candidate = (from + ChronoDuration::hours(1))
        .with_minute(0)?
        .with_second(0)?
        .with_nanosecond(0)?;
    for _ in 0..(8 * 24) {
        if windows.contains(&local_hour(tz, candidate)) {
            return Some(candidate);
        }
        candidate += ChronoDuration::hours(1);
    }
    None
}

/// Next tenant-local midnight strictly after `from`, as a UTC instant.
///
/// If the local midnight is skipped or ambiguous under a DST transition, the
/// earliest valid interpretation on that date is used.
pub fn next_local_midnight(tz: Tz, from: DateTime<Utc>) -> DateTime<Utc> {
    let local = from.with_timezone(&tz);
    let next_date = local
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(local.date_naive());
    let mut naive = next_date.and_hms_opt(0, 0, 0).expect("midnight exists");
    loop {
        match tz.from_local_datetime(&naive).earliest() {
            Some(resolved) => return resolved.with_timezone(&Utc),
            // Midnight itself was skipped by a DST jump; take the next hour.
            None => naive += ChronoDuration::hours(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn hours(list: &[u8]) -> BTreeSet<u8> {
        list.iter().copied().collect()
    }

    #[test]
    fn manual_clock_advances_together() {
        let clock = ManualClock::new(utc("2024-06-01T10:00:00Z"));
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now_mono(), Duration::from_secs(90));
        assert_eq!(clock.now_wall(), utc("2024-06-01T10:01:30Z"));
    }

    #[test]
    fn day_key_uses_tenant_zone() {
        // 03:00 UTC is still the previous day in New York.
        let wall = utc("2024-06-02T03:00:00Z");
        assert_eq!(day_key(UTC, wall), "2024-06-02");
        assert_eq!(day_key(New_York, wall), "2024-06-01");
    }

    #[test]
    fn window_membership_is_local() {
        let windows = hours(&[9, 10, 11]);
        // 14:00 UTC == 10:00 in New York (EDT).
        let wall = utc("2024-06-01T14:00:00Z");
        assert!(in_posting_window(&windows, New_York, wall));
        assert!(!in_posting_window(&windows, UTC, wall));
    }

    #[test]
    fn next_open_returns_from_when_inside() {
        let windows = hours(&[10]);
        let wall = utc("2024-06-01T10:30:00Z");
        assert_eq!(next_window_open(&windows, UTC, wall), Some(wall));
    }

    #[test]
    fn next_open_rounds_to_hour_boundary() {
        let windows = hours(&[12]);
        let wall = utc("2024-06-01T10:30:00Z");
        assert_eq!(
            next_window_open(&windows, UTC, wall),
            Some(utc("2024-06-01T12:00:00Z"))
        );
    }

    #[test]
    fn next_open_empty_windows_is_none() {
        assert!(next_window_open(&BTreeSet::new(), UTC, utc("2024-06-01T00:00:00Z")).is_none());
    }

    #[test]
    fn spring_forward_skips_missing_local_hour() {
        // US DST 2024: 2024-03-10, 02:00 EST jumps to 03:00 EDT. Local hour 2
        // does not occur that day; the window must open at 02:00 on the 11th.
        let windows = hours(&[2]);
        let from = utc("2024-03-10T05:00:00Z"); // 00:00 EST on the 10th
        let open = next_window_open(&windows, New_York, from).unwrap();
        assert_eq!(local_hour(New_York, open), 2);
        assert_eq!(day_key(New_York, open), "2024-03-11");
    }

    #[test]
    fn fall_back_keeps_repeated_hour_open() {
        // US DST 2024: 2024-11-03, 02:00 EDT falls back to 01:00 EST. Local
        // hour 1 spans two wall-clock hours; both are inside the window.
        let windows = hours(&[1]);
        let first = utc("2024-11-03T05:30:00Z"); // 01:30 EDT
        let second = utc("2024-11-03T06:30:00Z"); // 01:30 EST
        assert!(in_posting_window(&windows, New_York, first));
        assert!(in_posting_window(&windows, New_York, second));
    }

    #[test]
    fn midnight_rollover_in_zone() {
        let from = utc("2024-06-01T17:30:00Z");
        let midnight = next_local_midnight(New_York, from);
        assert_eq!(day_key(New_York, midnight), "2024-06-02");
        assert_eq!(local_hour(New_York, midnight), 0);
        // 00:00 EDT == 04:00 UTC.
        assert_eq!(midnight, utc("2024-06-02T04:00:00Z"));
    }
}
