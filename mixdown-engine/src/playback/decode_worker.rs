//! Per-track decode worker
//!
//! Each attached track gets one background thread that pulls coded frames
//! from the [`Demuxer`], decodes them, and keeps a bounded [`BlockQueue`]
//! topped up for the mixer.
//!
//! **Lifecycle:**
//! - The thread is spawned at construction but decodes nothing until
//!   [`DecodeWorker::start`] (the sink calls it once the output spec is known)
//! - Seeks are generation-tagged. A newer seek supersedes an in-flight one;
//!   the superseded completion callback never runs
//! - Decoding errors park the worker until the next seek. The error handler
//!   is invoked once per error, on the controlling thread
//! - Dropping the worker advances the generation, wakes the thread and joins it

use super::queue::BlockQueue;
use crate::dispatch::{Dispatcher, GenerationCounter};
use crate::error::Result;
use crate::media::{AudioDecoder, Demuxer, SeekScope};
use mixdown_common::timing::duration_to_frames;
use mixdown_common::{AudioBlock, MediaError, SampleSpecification, Track};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Invoked on the controlling thread when a seek has resolved
pub type SeekCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked on the controlling thread when decoding fails
pub type ErrorHandler = Arc<dyn Fn(MediaError) + Send + Sync + 'static>;

/// State shared between the worker handle and its thread.
/// Guarded by one mutex; the condvar is signalled on every change.
struct WorkerState {
    queue: BlockQueue,
    started: bool,
    exit: bool,

    /// Target of the most recent seek request
    seek_target: Duration,
    seek_callback: Option<SeekCallback>,
    /// Generation the decode thread has picked up
    active_generation: u64,

    output_spec: Option<SampleSpecification>,
    spec_changed: bool,

    error: Option<MediaError>,
    error_reported: bool,
    error_handler: Option<ErrorHandler>,

    end_of_stream: bool,
}

struct Shared {
    track: Track,
    state: Mutex<WorkerState>,
    wake: Condvar,
    generation: GenerationCounter,
}

/// What the decode thread should do next
enum Action {
    Exit,
    Seek {
        generation: u64,
        target: Duration,
        callback: Option<SeekCallback>,
    },
    Decode,
}

/// Handle to a track's decode thread
pub struct DecodeWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Spawn the decode thread for `track`. Fails if `queue_capacity` is 0.
    ///
    /// The thread waits for [`start`](Self::start) before touching the
    /// demuxer. Completions and errors are delivered through `dispatcher`.
    pub fn new(
        track: Track,
        demuxer: Arc<dyn Demuxer>,
        decoder: Box<dyn AudioDecoder>,
        dispatcher: Dispatcher,
        queue_capacity: usize,
    ) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(mixdown_common::Error::InvalidInput(format!(
                "{}: queue capacity must be at least 1",
                track
            ))
            .into());
        }

        let shared = Arc::new(Shared {
            track,
            state: Mutex::new(WorkerState {
                queue: BlockQueue::new(queue_capacity),
                started: false,
                exit: false,
                seek_target: Duration::ZERO,
                seek_callback: None,
                active_generation: 0,
                output_spec: None,
                spec_changed: false,
                error: None,
                error_reported: false,
                error_handler: None,
                end_of_stream: false,
            }),
            wake: Condvar::new(),
            generation: GenerationCounter::new(),
        });

        let decode_loop = DecodeLoop {
            shared: Arc::clone(&shared),
            demuxer,
            decoder,
            dispatcher,
            track_seekable: true,
        };

        let thread = thread::Builder::new()
            .name(format!("decode-{}", track.id))
            .spawn(move || decode_loop.run())?;

        debug!("Decode worker spawned for {} (queue capacity {})", track, queue_capacity);

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn track(&self) -> Track {
        self.shared.track
    }

    /// Allow the thread to begin decoding. Idempotent.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if !state.started {
            debug!("Starting decode worker for {}", self.shared.track);
            state.started = true;
            self.shared.wake.notify_all();
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Tell the decoder what the output wants. Queued blocks in the old
    /// specification are dropped.
    pub fn set_output_spec(&self, spec: SampleSpecification) {
        let mut state = self.shared.state.lock();
        if state.output_spec == Some(spec) {
            return;
        }
        state.output_spec = Some(spec);
        state.spec_changed = true;
        let dropped = state.queue.clear();
        if dropped > 0 {
            debug!("{}: output spec now {}, dropped {} queued blocks", self.shared.track, spec, dropped);
        }
        self.shared.wake.notify_all();
    }

    /// Install the decoding error handler. Wakes the thread so an error hit
    /// before a handler existed gets reported.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(MediaError) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        state.error_handler = Some(Arc::new(handler));
        self.shared.wake.notify_all();
    }

    /// Request a seek to `timestamp`.
    ///
    /// Clears the queue immediately and supersedes any seek still in flight.
    /// `on_done` runs on the controlling thread once blocks for the new
    /// position are queued, unless another seek arrives first.
    pub fn seek<F>(&self, timestamp: Duration, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let generation = self.shared.generation.advance();
        state.seek_target = timestamp;
        state.seek_callback = Some(Box::new(on_done));
        state.queue.clear();
        debug!("{}: seek to {:?} requested (generation {})", self.shared.track, timestamp, generation);
        self.shared.wake.notify_all();
    }

    /// Take the oldest queued block, if any. Called from the audio thread.
    pub fn pop_block(&self) -> Option<AudioBlock> {
        let mut state = self.shared.state.lock();
        let block = state.queue.pop();
        if block.is_some() {
            self.shared.wake.notify_one();
        }
        block
    }

    pub fn queued_blocks(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// The decoder has delivered everything for the current position
    pub fn is_end_of_stream(&self) -> bool {
        self.shared.state.lock().end_of_stream
    }

    pub fn is_in_error_state(&self) -> bool {
        self.shared.state.lock().error.is_some()
    }

    /// Current seek generation
    pub fn generation(&self) -> u64 {
        self.shared.generation.current()
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.exit = true;
            // Revoke any completion still queued on the dispatcher
            self.shared.generation.advance();
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(()) => debug!("Decode worker for {} joined", self.shared.track),
                Err(e) => error!("Decode worker for {} panicked: {:?}", self.shared.track, e),
            }
        }
    }
}

/// The decode thread's side. Owns the decoder outright.
struct DecodeLoop {
    shared: Arc<Shared>,
    demuxer: Arc<dyn Demuxer>,
    decoder: Box<dyn AudioDecoder>,
    dispatcher: Dispatcher,
    /// Cleared after the first track-scoped seek failure
    track_seekable: bool,
}

impl DecodeLoop {
    fn run(mut self) {
        let track = self.shared.track;

        if !self.wait_for_start() {
            debug!("Decode worker for {} exiting before start", track);
            return;
        }
        info!("Decode worker for {} running", track);

        loop {
            match self.next_action() {
                Action::Exit => break,
                Action::Seek {
                    generation,
                    target,
                    callback,
                } => self.seek(generation, target, callback),
                Action::Decode => self.decode_step(),
            }
        }

        debug!("Decode worker for {} exiting", track);
    }

    fn wait_for_start(&self) -> bool {
        let mut state = self.shared.state.lock();
        while !state.started && !state.exit {
            self.shared.wake.wait(&mut state);
        }
        !state.exit
    }

    /// Block until there is something to do
    fn next_action(&mut self) -> Action {
        let mut state = self.shared.state.lock();
        loop {
            if state.exit {
                return Action::Exit;
            }

            if state.spec_changed {
                state.spec_changed = false;
                if let Some(spec) = state.output_spec {
                    self.decoder.set_output_specification(spec);
                }
            }

            let generation = self.shared.generation.current();
            if generation != state.active_generation {
                state.active_generation = generation;
                state.error = None;
                state.error_reported = false;
                state.end_of_stream = false;
                return Action::Seek {
                    generation,
                    target: state.seek_target,
                    callback: state.seek_callback.take(),
                };
            }

            if let Some(err) = state.error.clone() {
                if !state.error_reported {
                    if let Some(handler) = state.error_handler.clone() {
                        state.error_reported = true;
                        self.dispatcher.post_if_current(&self.shared.generation, generation, move || {
                            handler(err)
                        });
                        continue;
                    }
                }
                self.shared.wake.wait(&mut state);
                continue;
            }

            if state.end_of_stream || state.queue.is_full() {
                self.shared.wake.wait(&mut state);
                continue;
            }

            return Action::Decode;
        }
    }

    /// Decode one coded frame and queue whatever it yields
    fn decode_step(&mut self) {
        let generation = self.shared.state.lock().active_generation;
        let signalled_end = match self.feed_decoder() {
            Ok(signalled_end) => signalled_end,
            Err(MediaError::Aborted) => return,
            Err(err) => return self.enter_error_state(generation, err),
        };

        loop {
            match self.decoder.write_next_block() {
                Ok(block) if block.is_empty() => continue,
                Ok(block) => {
                    if !self.push_block(generation, block) {
                        return;
                    }
                }
                Err(MediaError::NeedsMoreInput) if !signalled_end => return,
                Err(MediaError::NeedsMoreInput) | Err(MediaError::EndOfStream) => {
                    return self.mark_end_of_stream(generation);
                }
                Err(MediaError::Aborted) => return,
                Err(err) => return self.enter_error_state(generation, err),
            }
        }
    }

    /// Move one coded frame from the demuxer into the decoder.
    /// Returns true if the demuxer was exhausted and the decoder told so.
    fn feed_decoder(&mut self) -> std::result::Result<bool, MediaError> {
        match self.demuxer.next_sample_for_track(self.shared.track) {
            Ok(frame) => {
                trace!(
                    "{}: {} coded bytes at {:?}",
                    self.shared.track,
                    frame.data.len(),
                    frame.timestamp
                );
                match self.decoder.receive_coded_data(frame.timestamp, &frame.data) {
                    Ok(()) | Err(MediaError::NeedsMoreInput) => Ok(false),
                    Err(MediaError::EndOfStream) => {
                        self.decoder.signal_end_of_stream();
                        Ok(true)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(MediaError::EndOfStream) => {
                debug!("{}: demuxer reached end of stream", self.shared.track);
                self.decoder.signal_end_of_stream();
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Queue a block, waiting for space. Returns false if the block was
    /// dropped because the generation moved on or the worker is exiting.
    fn push_block(&self, generation: u64, block: AudioBlock) -> bool {
        let mut block = block;
        let mut state = self.shared.state.lock();
        loop {
            if state.exit || !self.shared.generation.is_current(generation) {
                trace!("{}: dropping block at frame {} (superseded)", self.shared.track, block.start_frame());
                return false;
            }
            match state.queue.push(block) {
                Ok(()) => return true,
                Err(rejected) => {
                    block = rejected;
                    self.shared.wake.wait(&mut state);
                }
            }
        }
    }

    fn mark_end_of_stream(&self, generation: u64) {
        let mut state = self.shared.state.lock();
        if self.shared.generation.is_current(generation) {
            debug!("{}: decoder drained", self.shared.track);
            state.end_of_stream = true;
        }
    }

    fn enter_error_state(&self, generation: u64, err: MediaError) {
        let mut state = self.shared.state.lock();
        if !self.shared.generation.is_current(generation) {
            // A newer seek resets the pipeline anyway
            debug!("{}: ignoring error from superseded generation: {}", self.shared.track, err);
            return;
        }
        error!("{}: decoding failed: {}", self.shared.track, err);
        state.queue.clear();
        state.error = Some(err);
        state.error_reported = false;
        self.shared.wake.notify_all();
    }

    fn is_superseded(&self, generation: u64) -> bool {
        !self.shared.generation.is_current(generation) || self.shared.state.lock().exit
    }

    /// Reposition the demuxer, falling back to a container-wide seek if the
    /// demuxer cannot seek this track alone
    fn seek_demuxer(&mut self, target: Duration) -> std::result::Result<Option<Duration>, MediaError> {
        let track = self.shared.track;
        if self.track_seekable {
            match self
                .demuxer
                .seek_to_most_recent_keyframe(track, target, SeekScope::Track)
            {
                Ok(moved) => return Ok(moved),
                Err(MediaError::EndOfStream) => return Err(MediaError::EndOfStream),
                Err(err) => {
                    warn!("{}: track seek failed ({}), using container seeks from now on", track, err);
                    self.track_seekable = false;
                }
            }
        }
        self.demuxer
            .seek_to_most_recent_keyframe(track, target, SeekScope::Container)
    }

    /// Decode forward from the keyframe before `target` until the first block
    /// at or after it, then publish that block (and the one just before it, so
    /// playback starts without a gap).
    fn seek(&mut self, generation: u64, target: Duration, callback: Option<SeekCallback>) {
        let track = self.shared.track;
        debug!("{}: seeking to {:?} (generation {})", track, target, generation);

        match self.seek_demuxer(target) {
            Ok(Some(position)) => {
                trace!("{}: demuxer moved to {:?}, flushing decoder", track, position);
                self.decoder.flush();
            }
            Ok(None) => {}
            Err(MediaError::EndOfStream) => {
                debug!("{}: seek target {:?} is past the end", track, target);
                self.decoder.flush();
                return self.finish_seek(generation, None, None, true, callback);
            }
            Err(err) => return self.enter_error_state(generation, err),
        }

        let mut before: Option<AudioBlock> = None;
        let mut signalled_end = false;

        loop {
            if self.is_superseded(generation) {
                debug!("{}: seek to {:?} abandoned", track, target);
                return;
            }

            if !signalled_end {
                match self.feed_decoder() {
                    Ok(end) => signalled_end = end,
                    Err(MediaError::Aborted) => continue,
                    Err(err) => return self.enter_error_state(generation, err),
                }
            }

            loop {
                match self.decoder.write_next_block() {
                    Ok(block) if block.is_empty() => continue,
                    Ok(block) => {
                        if !block.spec().is_valid() {
                            let err = MediaError::Decoder(format!(
                                "block with unusable specification {}",
                                block.spec()
                            ));
                            return self.enter_error_state(generation, err);
                        }
                        let target_frame = duration_to_frames(target, block.spec().sample_rate);
                        if block.start_frame() >= target_frame {
                            return self.finish_seek(generation, before, Some(block), false, callback);
                        }
                        before = Some(block);
                    }
                    Err(MediaError::NeedsMoreInput) if !signalled_end => break,
                    Err(MediaError::NeedsMoreInput) | Err(MediaError::EndOfStream) => {
                        return self.finish_seek(generation, before, None, true, callback);
                    }
                    Err(MediaError::Aborted) => break,
                    Err(err) => return self.enter_error_state(generation, err),
                }
            }
        }
    }

    fn finish_seek(
        &self,
        generation: u64,
        before: Option<AudioBlock>,
        after: Option<AudioBlock>,
        at_end: bool,
        callback: Option<SeekCallback>,
    ) {
        let track = self.shared.track;
        {
            let mut state = self.shared.state.lock();
            if state.exit || !self.shared.generation.is_current(generation) {
                debug!("{}: seek resolved after being superseded, discarding", track);
                return;
            }

            state.queue.clear();
            // With room for a single block only the target block matters
            if state.queue.capacity() > 1 || after.is_none() {
                if let Some(block) = before {
                    let pushed = state.queue.push(block);
                    debug_assert!(pushed.is_ok(), "cleared queue rejected a block");
                }
            }
            if let Some(block) = after {
                let pushed = state.queue.push(block);
                debug_assert!(pushed.is_ok(), "cleared queue rejected a block");
            }
            state.end_of_stream = at_end;
            self.shared.wake.notify_all();
        }

        debug!("{}: seek resolved (generation {})", track, generation);
        if let Some(callback) = callback {
            self.dispatcher
                .post_if_current(&self.shared.generation, generation, callback);
        }
    }
}
