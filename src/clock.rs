//! Monotonic clock access.
//!
//! Prefers a suspend-aware monotonic clock (`CLOCK_BOOTTIME`) over plain
//! `CLOCK_MONOTONIC` when available, so that a schedule isn't silently
//! compressed by time the host spent suspended.

use crate::errno::{Errno, Result};
use std::time::Duration;

/// A point in monotonic time, expressed as an offset from an arbitrary
/// epoch. Only differences between two `MonotonicTime` values are
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicTime(Duration);

impl MonotonicTime {
    /// Builds a `MonotonicTime` at a given offset from the epoch. Only
    /// meaningful relative to other `MonotonicTime` values from the same
    /// source — real code gets these from `Clock::now()`; a test `Clock`
    /// can use this directly to build a deterministic timeline.
    pub fn from_offset(d: Duration) -> MonotonicTime {
        MonotonicTime(d)
    }

    pub fn checked_add(self, d: Duration) -> Option<MonotonicTime> {
        self.0.checked_add(d).map(MonotonicTime)
    }

    pub fn saturating_duration_since(self, earlier: MonotonicTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

/// Sources of monotonic time and the wall it's measured against.
///
/// `now()` is the one piece of I/O the state machine performs outside the
/// reactor; it is behind a trait so tests can inject a fake clock instead of
/// waiting on real time.
pub trait Clock {
    fn now(&self) -> MonotonicTime;
}

/// The real clock, backed by `clock_gettime`.
///
/// Prefers `CLOCK_BOOTTIME` (counts time spent suspended) and falls back to
/// `CLOCK_MONOTONIC` on kernels old enough not to support it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    fn clock_gettime(clock_id: libc::clockid_t) -> Result<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(clock_id, &mut ts) };
        Errno::result(ret)?;
        Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    fn now_duration() -> Duration {
        Self::clock_gettime(libc::CLOCK_BOOTTIME)
            .or_else(|_| Self::clock_gettime(libc::CLOCK_MONOTONIC))
            .expect("clock_gettime(CLOCK_MONOTONIC) cannot fail")
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTime {
        MonotonicTime(Self::now_duration())
    }
}
