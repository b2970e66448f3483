//! Common error types for mixdown
//!
//! `Error` covers configuration and I/O failures shared by every crate.
//! `MediaError` is the taxonomy reported by demuxers and decoders; it carries
//! the non-error sentinels (`EndOfStream`, `Aborted`, `NeedsMoreInput`) next to
//! real failures so callers can match on one type.

use thiserror::Error;

/// Common result type for mixdown operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for demuxer and decoder operations
pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Common error types across mixdown crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors produced while demuxing or decoding a track.
///
/// `EndOfStream`, `Aborted` and `NeedsMoreInput` are flow-control signals, not
/// failures. Use [`MediaError::is_sentinel`] to tell them apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The stream has no more data
    #[error("End of stream")]
    EndOfStream,

    /// A blocking read was interrupted; the caller may retry
    #[error("Read aborted")]
    Aborted,

    /// The decoder has no block ready and wants more coded data
    #[error("Decoder needs more input")]
    NeedsMoreInput,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Container or bitstream is malformed
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Codec, container feature or track kind not supported
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Demuxer failure not covered above
    #[error("Demuxer error: {0}")]
    Demuxer(String),

    /// Decoder failure not covered above
    #[error("Decoder error: {0}")]
    Decoder(String),
}

impl MediaError {
    /// True for the flow-control variants that never surface as failures
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            MediaError::EndOfStream | MediaError::Aborted | MediaError::NeedsMoreInput
        )
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, MediaError::EndOfStream)
    }
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            MediaError::EndOfStream
        } else {
            MediaError::Io(err.to_string())
        }
    }
}
