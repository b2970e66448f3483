//! Playback stream interface
//!
//! A playback stream pulls interleaved f32 samples from a data callback on
//! the audio thread. Transport operations are asynchronous because the device
//! may need time to drain or start; each one resolves with the stream clock
//! (total time played) at the moment it took effect.

use crate::error::Result;
use futures::future::BoxFuture;
use mixdown_common::SampleSpecification;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by stream transport operations
pub type StreamFuture<T> = BoxFuture<'static, Result<T>>;

/// Fills an interleaved output buffer. Runs on the audio thread.
pub type DataCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Told the device's sample specification once it is known. May be called
/// from any thread and may be called again if the device renegotiates.
pub type SpecNegotiatedCallback = Box<dyn Fn(SampleSpecification) + Send + Sync + 'static>;

/// Whether a stream pulls data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Playing,
    Suspended,
}

/// Everything a backend needs to open a stream
pub struct StreamRequest {
    pub initial_state: OutputState,
    pub target_latency: Duration,
    /// Linear gain applied by the stream
    pub volume: f64,
    pub on_spec_negotiated: SpecNegotiatedCallback,
    pub data_callback: DataCallback,
}

/// An open output stream
pub trait PlaybackStream: Send + Sync {
    /// Start pulling data; resolves with the stream time at resumption
    fn resume(&self) -> StreamFuture<Duration>;

    /// Let queued audio play out, then stop; resolves with the stream time at
    /// suspension
    fn drain_buffer_and_suspend(&self) -> StreamFuture<Duration>;

    /// Stop now, dropping queued audio; resolves with the stream time at
    /// suspension
    fn discard_buffer_and_suspend(&self) -> StreamFuture<Duration>;

    fn set_volume(&self, volume: f64) -> StreamFuture<()>;

    /// Stream clock. Monotonic while playing, frozen while suspended.
    fn total_time_played(&self) -> Duration;
}

/// Factory for playback streams
pub trait PlaybackBackend: Send + Sync {
    fn create_stream(&self, request: StreamRequest) -> Result<Arc<dyn PlaybackStream>>;
}
