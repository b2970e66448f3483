//! Core audio data types
//!
//! Defines the value types that flow through the decode-mix pipeline.
//!
//! **Format:**
//! - Samples are f32 (floating point -1.0 to 1.0)
//! - Interleaved by frame: [ch0, ch1, ..., ch0, ch1, ...]
//! - Positions are absolute sample-frames since stream start

use crate::timing::frames_to_duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Channel arrangement of interleaved samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// Any other channel count, in stream order
    Discrete(u16),
}

impl ChannelLayout {
    /// Pick the layout for a raw channel count
    pub fn from_count(count: u16) -> Self {
        match count {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            n => ChannelLayout::Discrete(n),
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Discrete(n) => *n as usize,
        }
    }
}

/// Sample rate and channel layout describing how raw samples are interpreted.
///
/// Two specifications are equal only if both rate and layout match exactly;
/// `Discrete(2)` is not the same layout as `Stereo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSpecification {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
}

impl SampleSpecification {
    pub fn new(sample_rate: u32, channel_layout: ChannelLayout) -> Self {
        Self {
            sample_rate,
            channel_layout,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, ChannelLayout::Mono)
    }

    pub fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, ChannelLayout::Stereo)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_layout.channel_count()
    }

    /// A specification the pipeline can actually render
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channel_count() > 0
    }
}

impl fmt::Display for SampleSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channel_count())
    }
}

/// A span of decoded interleaved PCM tagged with its specification and
/// absolute starting frame.
///
/// The empty block is a distinguished value meaning "nothing here"; mixer
/// cursors start out holding it and return to it whenever a queue is cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    spec: SampleSpecification,
    start_frame: u64,
    samples: Vec<f32>,
}

impl AudioBlock {
    /// Create a block from interleaved samples.
    ///
    /// # Panics
    /// Panics if the sample count is not a whole number of frames.
    pub fn new(spec: SampleSpecification, start_frame: u64, samples: Vec<f32>) -> Self {
        let channels = spec.channel_count().max(1);
        assert_eq!(
            samples.len() % channels,
            0,
            "sample count {} is not a multiple of channel count {}",
            samples.len(),
            channels
        );

        Self {
            spec,
            start_frame,
            samples,
        }
    }

    /// The empty block
    pub fn empty() -> Self {
        Self {
            spec: SampleSpecification::new(0, ChannelLayout::Mono),
            start_frame: 0,
            samples: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn spec(&self) -> SampleSpecification {
        self.spec
    }

    /// First frame covered by this block
    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    /// Number of frames held
    pub fn frame_count(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.samples.len() / self.spec.channel_count()) as u64
    }

    /// One past the last frame covered by this block
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frame_count()
    }

    /// Presentation time of the first frame
    pub fn start_time(&self) -> Duration {
        if self.spec.sample_rate == 0 {
            return Duration::ZERO;
        }
        frames_to_duration(self.start_frame, self.spec.sample_rate)
    }

    /// Presentation time just past the last frame
    pub fn end_time(&self) -> Duration {
        if self.spec.sample_rate == 0 {
            return Duration::ZERO;
        }
        frames_to_duration(self.end_frame(), self.spec.sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Interleaved samples for frames `[first, first + count)` relative to the
    /// block start. Returns an empty slice if the range is outside the block.
    pub fn frame_slice(&self, first: u64, count: u64) -> &[f32] {
        let frames = self.frame_count();
        if first >= frames {
            return &[];
        }
        let count = count.min(frames - first);
        let channels = self.spec.channel_count();
        let begin = first as usize * channels;
        let end = begin + count as usize * channels;
        &self.samples[begin..end]
    }
}

impl Default for AudioBlock {
    fn default() -> Self {
        Self::empty()
    }
}

/// What a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
    Other,
}

/// Opaque track identity supplied by the surrounding system.
///
/// Used as a map key; the pipeline never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub kind: MediaKind,
}

impl Track {
    pub fn new(id: u64, kind: MediaKind) -> Self {
        Self { id, kind }
    }

    pub fn audio(id: u64) -> Self {
        Self::new(id, MediaKind::Audio)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} track {}", self.kind, self.id)
    }
}
