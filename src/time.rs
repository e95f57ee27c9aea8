//! Monotonic time as signed nanoseconds.
//!
//! All deadlines in this crate are absolute readings of a process-wide
//! monotonic clock. `NEVER` is the infinitely-distant deadline; arithmetic
//! saturates toward it so an overflowing addition never wraps into the past.

use std::time::{Duration, Instant};

use lazy_static::lazy_static;

/// A deadline that never arrives.
pub const NEVER: i64 = i64::MAX;

lazy_static! {
    /// Zero point of the monotonic clock, fixed on first use.
    static ref ANCHOR: Instant = Instant::now();
}

/// Current monotonic time in nanoseconds since the process anchor.
pub fn now() -> i64 {
    // 2^63 ns is almost 300 years; the cast cannot truncate in practice.
    ANCHOR.elapsed().as_nanos() as i64
}

/// Converts an absolute monotonic time back into an `Instant` suitable for
/// `Condvar::wait_until`. Must not be called with `NEVER`.
pub fn instant_at(t: i64) -> Instant {
    debug_assert!(t != NEVER);
    *ANCHOR + Duration::from_nanos(t.max(0) as u64)
}

/// `t + d`, saturating to `NEVER`.
pub fn add_duration(t: i64, d: i64) -> i64 {
    t.saturating_add(d)
}

/// `n` milliseconds as a duration in nanoseconds.
pub const fn msecs(n: i64) -> i64 {
    n * 1_000_000
}

/// `n` seconds as a duration in nanoseconds.
pub const fn secs(n: i64) -> i64 {
    n * 1_000_000_000
}
