//! Mixing sink
//!
//! Owns one [`DecodeWorker`] per attached track and a single playback stream.
//! The stream's data callback sums every track into the device buffer; the
//! transport operations (resume, pause, set_time, volume) drive the stream and
//! maintain the media clock.
//!
//! **Threads:**
//! - Audio thread: only the data callback, which locks the mix state briefly
//!   and pops from worker queues
//! - Controlling thread: everything else, including spec negotiation, which
//!   backends report from arbitrary threads and the sink re-posts through the
//!   [`Dispatcher`]
//!
//! **Position:** the write position counts frames handed to the stream since
//! the last set_time. `current_time` projects the transport anchor along the
//! stream clock and never reports past the write position.

use super::cursor::{mix_track, TrackMixingCursor};
use super::decode_worker::DecodeWorker;
use super::transport::{Transport, TransportAnchor};
use crate::audio::stream::{
    DataCallback, OutputState, PlaybackBackend, PlaybackStream, SpecNegotiatedCallback,
    StreamRequest,
};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use mixdown_common::timing::{duration_to_frames, frames_to_duration};
use mixdown_common::{SampleSpecification, Track};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Counters maintained by the data callback
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MixStatistics {
    /// Data callback invocations
    pub callbacks: u64,
    /// Frames rendered (silence included)
    pub frames_written: u64,
    /// Track windows left partly unfilled while the track was still decoding
    pub underruns: u64,
    /// Blocks dropped for not matching the output specification
    pub discarded_blocks: u64,
}

struct TrackEntry {
    worker: DecodeWorker,
    cursor: TrackMixingCursor,
}

/// State shared with the audio thread
struct MixState {
    spec: Option<SampleSpecification>,
    tracks: HashMap<Track, TrackEntry>,
    /// Absolute frame of the next sample to write; meaningful once spec is known
    write_position: u64,
    /// set_time target received before the output spec was known
    pending_position: Option<Duration>,
    statistics: MixStatistics,
}

impl MixState {
    fn new() -> Self {
        Self {
            spec: None,
            tracks: HashMap::new(),
            write_position: 0,
            pending_position: None,
            statistics: MixStatistics::default(),
        }
    }

    /// Fill one device buffer
    fn render(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        self.statistics.callbacks += 1;

        // No spec yet: silence, and the position does not move
        let Some(spec) = self.spec else {
            return;
        };

        let frames = (output.len() / spec.channel_count()) as u64;
        let window_start = self.write_position;

        for (track, entry) in self.tracks.iter_mut() {
            let TrackEntry { worker, cursor } = entry;
            let outcome = mix_track(cursor, || worker.pop_block(), spec, window_start, output);

            self.statistics.discarded_blocks += outcome.discarded_blocks;
            if outcome.starved
                && worker.is_started()
                && !worker.is_end_of_stream()
                && !worker.is_in_error_state()
            {
                self.statistics.underruns += 1;
                trace!("{} underrun at frame {}", track, window_start);
            }
        }

        self.write_position += frames;
        self.statistics.frames_written += frames;
    }

    /// Media time of the write position
    fn written_time(&self) -> Duration {
        match self.spec {
            Some(spec) => frames_to_duration(self.write_position, spec.sample_rate),
            None => self.pending_position.unwrap_or(Duration::ZERO),
        }
    }

    /// Jump to `time`, forgetting every cursor
    fn reposition(&mut self, time: Duration) {
        match self.spec {
            Some(spec) => self.write_position = duration_to_frames(time, spec.sample_rate),
            None => self.pending_position = Some(time),
        }
        for entry in self.tracks.values_mut() {
            entry.cursor.reset();
        }
    }

    fn apply_negotiated_spec(&mut self, spec: SampleSpecification) {
        if !spec.is_valid() {
            warn!("Ignoring unusable output specification {}", spec);
            return;
        }
        if self.spec == Some(spec) {
            return;
        }

        let position = self.written_time();
        info!("Output negotiated {}", spec);
        self.spec = Some(spec);
        self.pending_position = None;
        self.write_position = duration_to_frames(position, spec.sample_rate);

        for entry in self.tracks.values_mut() {
            entry.cursor.reset();
            entry.worker.set_output_spec(spec);
            entry.worker.start();
        }
    }
}

/// Mixes attached tracks into one playback stream
pub struct MixingSink {
    backend: Arc<dyn PlaybackBackend>,
    dispatcher: Dispatcher,
    target_latency: Duration,
    /// Dropped before `mix` so callbacks stop before workers are joined
    stream: Mutex<Option<Arc<dyn PlaybackStream>>>,
    mix: Arc<Mutex<MixState>>,
    transport: Mutex<Transport>,
}

impl MixingSink {
    /// Create a sink. No stream is opened until the first track is attached.
    pub fn new(backend: Arc<dyn PlaybackBackend>, dispatcher: Dispatcher, target_latency: Duration) -> Self {
        Self {
            backend,
            dispatcher,
            target_latency,
            stream: Mutex::new(None),
            mix: Arc::new(Mutex::new(MixState::new())),
            transport: Mutex::new(Transport::new()),
        }
    }

    /// Attach `track`, handing its decode worker to the sink.
    ///
    /// Opens the playback stream on first use. If that fails the track stays
    /// attached, the error is returned, and the next attach tries again.
    pub fn attach(&self, track: Track, worker: DecodeWorker) -> Result<()> {
        let replaced = {
            let mut mix = self.mix.lock();
            if let Some(spec) = mix.spec {
                worker.set_output_spec(spec);
                worker.start();
            }
            mix.tracks.insert(
                track,
                TrackEntry {
                    worker,
                    cursor: TrackMixingCursor::new(),
                },
            )
        };

        if replaced.is_some() {
            info!("Replaced decode worker for {}", track);
        } else {
            info!("Attached {}", track);
        }
        // Join the old thread outside the mix lock
        drop(replaced);

        self.ensure_stream()
    }

    /// Detach `track`. Its worker is stopped and joined.
    pub fn detach(&self, track: Track) -> Result<()> {
        let removed = self.mix.lock().tracks.remove(&track);
        match removed {
            Some(entry) => {
                drop(entry);
                info!("Detached {}", track);
                Ok(())
            }
            None => Err(Error::TrackNotAttached(track)),
        }
    }

    /// Forward a seek to the track's worker. `on_done` runs on the
    /// controlling thread once the worker has data for the new position.
    pub fn seek<F>(&self, track: Track, timestamp: Duration, on_done: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut mix = self.mix.lock();
        let entry = mix
            .tracks
            .get_mut(&track)
            .ok_or(Error::TrackNotAttached(track))?;
        entry.cursor.reset();
        entry.worker.seek(timestamp, on_done);
        Ok(())
    }

    /// Install a decode error handler on an attached track
    pub fn set_error_handler<F>(&self, track: Track, handler: F) -> Result<()>
    where
        F: Fn(mixdown_common::MediaError) + Send + Sync + 'static,
    {
        let mix = self.mix.lock();
        let entry = mix.tracks.get(&track).ok_or(Error::TrackNotAttached(track))?;
        entry.worker.set_error_handler(handler);
        Ok(())
    }

    /// Start or continue playback
    pub async fn resume(&self) -> Result<()> {
        let epoch = self.transport.lock().begin_transition(true);
        let Some(stream) = self.current_stream() else {
            debug!("Resume requested before a stream exists");
            return Ok(());
        };

        let stream_time = stream.resume().await?;
        self.complete_transition(epoch, stream_time, true);
        info!("Playback resumed");
        Ok(())
    }

    /// Pause after letting already-buffered audio play out
    pub async fn pause(&self) -> Result<()> {
        let epoch = self.transport.lock().begin_transition(false);
        let Some(stream) = self.current_stream() else {
            return Ok(());
        };

        let stream_time = stream.drain_buffer_and_suspend().await?;
        self.complete_transition(epoch, stream_time, false);
        info!("Playback paused");
        Ok(())
    }

    /// Pause now, dropping buffered audio
    pub async fn pause_immediately(&self) -> Result<()> {
        let epoch = self.transport.lock().begin_transition(false);
        let Some(stream) = self.current_stream() else {
            return Ok(());
        };

        let stream_time = stream.discard_buffer_and_suspend().await?;
        self.complete_transition(epoch, stream_time, false);
        info!("Playback paused immediately");
        Ok(())
    }

    /// Move the media clock and write position to `time`.
    ///
    /// Suspends the stream, repositions, and resumes if playing. Calls made
    /// while one is in flight are coalesced: they return at once and only the
    /// latest target is applied by the call already running.
    pub async fn set_time(&self, time: Duration) -> Result<()> {
        {
            let mut transport = self.transport.lock();
            transport.pending_time = Some(time);
            if transport.set_time_in_flight {
                debug!("Coalescing set_time({:?}) into the one in flight", time);
                return Ok(());
            }
            transport.set_time_in_flight = true;
        }

        let result = self.run_set_time().await;
        self.transport.lock().set_time_in_flight = false;
        result
    }

    async fn run_set_time(&self) -> Result<()> {
        loop {
            let stream = self.current_stream();
            let mut stream_time = match &stream {
                Some(stream) => stream.drain_buffer_and_suspend().await?,
                None => Duration::ZERO,
            };

            let (time, playing) = {
                let mut transport = self.transport.lock();
                match transport.pending_time.take() {
                    Some(time) => (time, transport.playing),
                    None => return Ok(()),
                }
            };

            self.mix.lock().reposition(time);
            // Hold the clock at the new position until the stream resumes
            self.transport
                .lock()
                .reanchor(TransportAnchor::new(time, stream_time), false);
            debug!("Write position moved to {:?}", time);

            if let (true, Some(stream)) = (playing, &stream) {
                stream_time = stream.resume().await?;
            }

            let mut transport = self.transport.lock();
            if transport.pending_time.is_some() {
                debug!("set_time({:?}) superseded, applying newer target", time);
                continue;
            }
            transport.reanchor(
                TransportAnchor::new(time, stream_time),
                playing && stream.is_some(),
            );
            info!("Media time set to {:?}", time);
            return Ok(());
        }
    }

    /// Current media time.
    ///
    /// Never exceeds the write position. Between transport operations it
    /// never goes backwards unless the write position itself moved back
    /// (a renegotiated output rate can truncate it by a frame).
    pub fn current_time(&self) -> Duration {
        let stream_now = self.current_stream().map(|s| s.total_time_played());
        let limit = self.mix.lock().written_time();

        let mut transport = self.transport.lock();
        let mut now = transport.media_time_at(stream_now);
        if transport.clock_running {
            now = now.max(transport.last_reported);
        }
        // The write position bounds everything, including earlier reports
        let now = now.min(limit);
        transport.last_reported = now;
        now
    }

    /// Set the stream gain. Remembered for streams opened later.
    pub async fn set_volume(&self, volume: f64) -> Result<()> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(Error::InvalidVolume(volume));
        }
        self.transport.lock().volume = volume;
        if let Some(stream) = self.current_stream() {
            stream.set_volume(volume).await?;
        }
        debug!("Volume set to {:.2}", volume);
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        self.transport.lock().volume
    }

    pub fn is_playing(&self) -> bool {
        self.transport.lock().playing
    }

    pub fn statistics(&self) -> MixStatistics {
        self.mix.lock().statistics
    }

    /// Output specification, once negotiated
    pub fn output_spec(&self) -> Option<SampleSpecification> {
        self.mix.lock().spec
    }

    /// Frames written since the last set_time origin
    pub fn write_position(&self) -> u64 {
        self.mix.lock().write_position
    }

    pub fn attached_tracks(&self) -> Vec<Track> {
        self.mix.lock().tracks.keys().copied().collect()
    }

    /// Blocks waiting in `track`'s queue
    pub fn queued_blocks(&self, track: Track) -> Option<usize> {
        self.mix.lock().tracks.get(&track).map(|e| e.worker.queued_blocks())
    }

    /// True once every attached track has either played out or failed
    pub fn all_tracks_ended(&self) -> bool {
        let mix = self.mix.lock();
        !mix.tracks.is_empty()
            && mix.tracks.values().all(|e| {
                e.worker.is_in_error_state()
                    || (e.worker.is_end_of_stream() && e.worker.queued_blocks() == 0)
            })
    }

    /// Tracks whose worker is stuck in the error state
    pub fn failed_tracks(&self) -> Vec<Track> {
        self.mix
            .lock()
            .tracks
            .iter()
            .filter(|(_, e)| e.worker.is_in_error_state())
            .map(|(track, _)| *track)
            .collect()
    }

    fn current_stream(&self) -> Option<Arc<dyn PlaybackStream>> {
        self.stream.lock().clone()
    }

    /// Record a finished resume/pause unless something newer happened since
    fn complete_transition(&self, epoch: u64, stream_time: Duration, running: bool) {
        let limit = self.mix.lock().written_time();
        let mut transport = self.transport.lock();
        if transport.epoch != epoch || transport.set_time_in_flight {
            debug!("Transport completion for epoch {} superseded", epoch);
            return;
        }
        let media_time = transport.media_time_at(Some(stream_time)).min(limit);
        transport.reanchor(TransportAnchor::new(media_time, stream_time), running);
    }

    fn ensure_stream(&self) -> Result<()> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (initial_state, volume) = {
            let transport = self.transport.lock();
            let state = if transport.playing {
                OutputState::Playing
            } else {
                OutputState::Suspended
            };
            (state, transport.volume)
        };

        let request = StreamRequest {
            initial_state,
            target_latency: self.target_latency,
            volume,
            on_spec_negotiated: self.spec_negotiated_callback(),
            data_callback: self.data_callback(),
        };

        match self.backend.create_stream(request) {
            Ok(stream) => {
                info!("Playback stream opened ({:?})", initial_state);
                let stream_time = stream.total_time_played();
                *slot = Some(stream);

                let mut transport = self.transport.lock();
                let media_time = transport.anchor.media_time;
                transport.reanchor(
                    TransportAnchor::new(media_time, stream_time),
                    initial_state == OutputState::Playing,
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to open playback stream: {}", e);
                Err(e)
            }
        }
    }

    fn spec_negotiated_callback(&self) -> SpecNegotiatedCallback {
        let mix: Weak<Mutex<MixState>> = Arc::downgrade(&self.mix);
        let dispatcher = self.dispatcher.clone();
        Box::new(move |spec| {
            let mix = mix.clone();
            dispatcher.post(move || {
                if let Some(mix) = mix.upgrade() {
                    mix.lock().apply_negotiated_spec(spec);
                }
            });
        })
    }

    fn data_callback(&self) -> DataCallback {
        let mix: Weak<Mutex<MixState>> = Arc::downgrade(&self.mix);
        Box::new(move |output: &mut [f32]| match mix.upgrade() {
            Some(mix) => mix.lock().render(output),
            None => output.fill(0.0),
        })
    }
}
