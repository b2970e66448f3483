//! # Mixdown Playback Engine (mixdown-engine)
//!
//! Decodes any number of audio tracks on background threads and mixes them
//! into a single playback stream.
//!
//! **Architecture:**
//! - One [`DecodeWorker`] thread per track fills a bounded queue of decoded blocks
//! - The [`MixingSink`] sums every track's queue into the device buffer on the
//!   audio thread and owns the transport (play, pause, seek, volume, clock)
//! - Completions are marshalled back to the controlling thread through a
//!   [`Dispatcher`]/[`EventLoop`] pair
//!
//! Demuxing, decoding and audio output sit behind traits
//! ([`media::Demuxer`], [`media::AudioDecoder`], [`audio::PlaybackBackend`]) with
//! symphonia and cpal implementations provided.

pub mod audio;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod playback;

pub use dispatch::{Dispatcher, EventLoop, GenerationCounter};
pub use error::{Error, Result};
pub use playback::{DecodeWorker, MixStatistics, MixingSink};
