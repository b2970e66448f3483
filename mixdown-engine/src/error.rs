//! Error types for mixdown-engine
//!
//! Defines engine error types using thiserror for clear error propagation.
//! Demuxer and decoder failures arrive as [`MediaError`] and are wrapped here
//! when they cross into sink or CLI code.

use mixdown_common::{MediaError, Track};
use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] mixdown_common::Error),

    /// Demuxing or decoding errors
    #[error("Audio decode error: {0}")]
    Decode(#[from] MediaError),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Playback stream creation or transport failure
    #[error("Playback stream error: {0}")]
    Stream(String),

    /// Operation names a track that is not attached to the sink
    #[error("Track not attached: {0}")]
    TrackNotAttached(Track),

    /// Volume must be a finite, non-negative gain
    #[error("Invalid volume: {0}")]
    InvalidVolume(f64),

    /// Worker thread spawn and other I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
