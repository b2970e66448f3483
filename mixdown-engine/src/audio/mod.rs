//! Audio output
//!
//! [`PlaybackBackend`] creates [`PlaybackStream`]s; the cpal implementation
//! lives in [`output`].

pub mod output;
pub mod stream;

pub use output::{CpalBackend, CpalPlaybackStream};
pub use stream::{
    DataCallback, OutputState, PlaybackBackend, PlaybackStream, SpecNegotiatedCallback,
    StreamFuture, StreamRequest,
};
