//! Frame/time conversions
//!
//! The pipeline positions audio in absolute sample-frames since stream start.
//! The public API speaks `Duration`. Conversions go through nanoseconds in
//! `u128` so hour-long streams at 192 kHz stay exact to the nanosecond.
//!
//! - Duration → frames truncates (a frame is counted once it has fully started)
//! - Frames → duration rounds up to the next whole nanosecond, so converting
//!   back always yields the original frame count

use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Convert a duration to a frame count at `sample_rate`.
///
/// # Panics
/// Panics if `sample_rate` is zero.
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    assert!(sample_rate > 0, "sample_rate must be > 0");
    let frames = duration.as_nanos() * sample_rate as u128 / NANOS_PER_SECOND;
    frames.min(u64::MAX as u128) as u64
}

/// Convert a frame count at `sample_rate` to a duration.
///
/// # Panics
/// Panics if `sample_rate` is zero.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    assert!(sample_rate > 0, "sample_rate must be > 0");
    let rate = sample_rate as u128;
    let nanos = (frames as u128 * NANOS_PER_SECOND + rate - 1) / rate;
    let secs = (nanos / NANOS_PER_SECOND) as u64;
    let sub = (nanos % NANOS_PER_SECOND) as u32;
    Duration::new(secs, sub)
}
