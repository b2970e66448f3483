//! Demuxer and decoder interfaces
//!
//! A [`DecodeWorker`](crate::playback::DecodeWorker) pulls coded frames from a
//! [`Demuxer`] and pushes them through an [`AudioDecoder`]. Both are traits so
//! the pipeline can be driven by symphonia in production and by synthetic
//! fixtures in tests.
//!
//! Flow control travels in the error channel: `EndOfStream`, `Aborted` and
//! `NeedsMoreInput` are [`MediaError`](mixdown_common::MediaError) sentinels, not failures.

pub mod symphonia_adapter;

pub use symphonia_adapter::{SymphoniaDecoder, SymphoniaDemuxer};

use mixdown_common::{AudioBlock, MediaResult, SampleSpecification, Track};
use std::fmt;
use std::time::Duration;

/// One unit of coded data for a single track
#[derive(Debug, Clone, PartialEq)]
pub struct CodedFrame {
    /// Presentation timestamp
    pub timestamp: Duration,
    /// Duration, if the container knows it
    pub duration: Option<Duration>,
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// How far a seek may reposition the demuxer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekScope {
    /// Reposition only the named track
    Track,
    /// Reposition the whole container (every track)
    Container,
}

/// Short codec name, e.g. `"flac"` or `"mp3"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecId(pub String);

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of coded frames.
///
/// Shared between the decode workers of every track in a container, so
/// methods take `&self` and implementations synchronize internally.
pub trait Demuxer: Send + Sync {
    /// Next coded frame for `track`.
    ///
    /// Returns `Err(EndOfStream)` once the track is exhausted and
    /// `Err(Aborted)` if a blocking read was interrupted.
    fn next_sample_for_track(&self, track: Track) -> MediaResult<CodedFrame>;

    /// Reposition to the most recent keyframe at or before `timestamp`.
    ///
    /// Returns `Ok(Some(position))` if the read position moved, `Ok(None)` if
    /// it was already there.
    fn seek_to_most_recent_keyframe(
        &self,
        track: Track,
        timestamp: Duration,
        scope: SeekScope,
    ) -> MediaResult<Option<Duration>>;

    fn codec_id_for_track(&self, track: Track) -> MediaResult<CodecId>;

    /// Codec-private setup bytes (may be empty)
    fn codec_initialization_data_for_track(&self, track: Track) -> MediaResult<Vec<u8>>;

    /// Total track duration, if the container declares one
    fn duration_of_track(&self, _track: Track) -> MediaResult<Option<Duration>> {
        Ok(None)
    }
}

/// Turns coded frames into decoded [`AudioBlock`]s.
///
/// Owned by exactly one decode worker, so `&mut self` is fine.
pub trait AudioDecoder: Send {
    /// Feed one coded frame presented at `timestamp`
    fn receive_coded_data(&mut self, timestamp: Duration, data: &[u8]) -> MediaResult<()>;

    /// Next decoded block.
    ///
    /// Returns `Err(NeedsMoreInput)` when starved, and `Err(EndOfStream)` once
    /// [`signal_end_of_stream`](Self::signal_end_of_stream) was called and
    /// everything buffered has been returned.
    fn write_next_block(&mut self) -> MediaResult<AudioBlock>;

    fn signal_end_of_stream(&mut self);

    /// Drop all buffered state, e.g. after the demuxer was repositioned
    fn flush(&mut self);

    /// Ask for output in `spec`. Decoders that cannot convert ignore this;
    /// mismatched blocks are then discarded by the mixer.
    fn set_output_specification(&mut self, _spec: SampleSpecification) {}
}

