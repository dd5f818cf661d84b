// ABOUTME: Monotonic microsecond clock shared with the Link daemon
// ABOUTME: Raw CLOCK_MONOTONIC so probe timestamps line up with Link's timeline

use rustix::time::{clock_gettime, ClockId};

/// Current time on the raw monotonic clock, in microseconds.
///
/// Carabiner answers `beat-at-time` and `phase-at-time` queries on the Link
/// session clock, which is the platform's monotonic clock — the same one
/// DJ-Link beat packets are timestamped with. An [`std::time::Instant`]
/// epoch would not line up, so the value is read directly.
pub fn monotonic_micros() -> i64 {
    let now = clock_gettime(ClockId::Monotonic);
    now.tv_sec as i64 * 1_000_000 + now.tv_nsec as i64 / 1_000
}
