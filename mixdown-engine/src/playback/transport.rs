//! Transport state and media clock
//!
//! Media time is derived from the playback stream's own clock. A
//! [`TransportAnchor`] pairs a media time with the stream time at which it was
//! true; while the clock runs, media time advances one-for-one with stream
//! time from there.

use std::time::Duration;

/// (media time, stream time) pair the media clock projects from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportAnchor {
    pub media_time: Duration,
    pub stream_time: Duration,
}

impl TransportAnchor {
    pub fn new(media_time: Duration, stream_time: Duration) -> Self {
        Self {
            media_time,
            stream_time,
        }
    }

    /// Media time at `stream_now`. Never earlier than the anchor itself.
    pub fn project(&self, stream_now: Duration) -> Duration {
        self.media_time + stream_now.saturating_sub(self.stream_time)
    }
}

/// Controlling-thread transport bookkeeping for the sink
#[derive(Debug)]
pub(crate) struct Transport {
    /// Requested state: resume() sets it, pause() clears it
    pub playing: bool,
    /// Linear gain, remembered for streams created later
    pub volume: f64,
    pub anchor: TransportAnchor,
    /// True while the anchor projects forward with the stream clock
    pub clock_running: bool,
    /// Bumped by resume and pause so a late completion cannot overwrite a
    /// newer anchor
    pub epoch: u64,
    /// Latest set_time target not yet applied
    pub pending_time: Option<Duration>,
    pub set_time_in_flight: bool,
    /// Last value handed out by current_time, for monotonicity
    pub last_reported: Duration,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            playing: false,
            volume: 1.0,
            anchor: TransportAnchor::default(),
            clock_running: false,
            epoch: 0,
            pending_time: None,
            set_time_in_flight: false,
            last_reported: Duration::ZERO,
        }
    }

    /// Unclamped media time at `stream_now`
    pub fn media_time_at(&self, stream_now: Option<Duration>) -> Duration {
        match stream_now {
            Some(now) if self.clock_running => self.anchor.project(now),
            _ => self.anchor.media_time,
        }
    }

    /// Replace the anchor and restart monotonicity from it
    pub fn reanchor(&mut self, anchor: TransportAnchor, clock_running: bool) {
        self.anchor = anchor;
        self.clock_running = clock_running;
        self.last_reported = anchor.media_time;
    }

    /// Start a resume or pause; returns the epoch the completion must match
    pub fn begin_transition(&mut self, playing: bool) -> u64 {
        self.playing = playing;
        self.epoch += 1;
        self.epoch
    }
}
