//! Test fixtures: synthetic demuxer/decoder and a hand-driven playback backend
#![allow(dead_code)]

use futures::FutureExt;
use mixdown_common::timing::{duration_to_frames, frames_to_duration};
use mixdown_common::{AudioBlock, MediaError, MediaResult, SampleSpecification, Track};
use mixdown_engine::audio::{
    DataCallback, OutputState, PlaybackBackend, PlaybackStream, SpecNegotiatedCallback,
    StreamFuture, StreamRequest,
};
use mixdown_engine::media::{AudioDecoder, CodecId, CodedFrame, Demuxer, SeekScope};
use mixdown_engine::{DecodeWorker, Dispatcher, Error, EventLoop, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const RATE: u32 = 48_000;

pub fn mono() -> SampleSpecification {
    SampleSpecification::mono(RATE)
}

/// Pump `event_loop` until `condition` holds or `timeout` passes
pub fn wait_until<F>(event_loop: &mut EventLoop, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        event_loop.pump();
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Keep pumping for `duration` (to let anything that should not happen, happen)
pub fn settle(event_loop: &mut EventLoop, duration: Duration) {
    wait_until(event_loop, duration, || false);
}

/// Synthetic container: one track of fixed-size packets.
///
/// Packet payload is `[frames: u32 LE][amplitude: f32 LE]`, which
/// [`FixtureDecoder`] expands into a constant block.
pub struct FixtureDemuxer {
    spec: SampleSpecification,
    total_frames: u64,
    frames_per_packet: u64,
    keyframe_interval: u64,
    amplitude: f32,
    next_packet: Mutex<u64>,
    /// Track-scoped seeks fail with an error when set
    pub reject_track_seeks: AtomicBool,
    pub track_seeks: AtomicUsize,
    pub container_seeks: AtomicUsize,
    /// Optional delay per packet read
    pub read_delay: Mutex<Option<Duration>>,
}

impl FixtureDemuxer {
    pub fn new(spec: SampleSpecification, duration: Duration, frames_per_packet: u64) -> Self {
        Self {
            spec,
            total_frames: duration_to_frames(duration, spec.sample_rate),
            frames_per_packet,
            keyframe_interval: 1,
            amplitude: 1.0,
            next_packet: Mutex::new(0),
            reject_track_seeks: AtomicBool::new(false),
            track_seeks: AtomicUsize::new(0),
            container_seeks: AtomicUsize::new(0),
            read_delay: Mutex::new(None),
        }
    }

    pub fn with_keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframe_interval = interval.max(1);
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn packet_count(&self) -> u64 {
        self.total_frames.div_ceil(self.frames_per_packet)
    }
}

impl Demuxer for FixtureDemuxer {
    fn next_sample_for_track(&self, _track: Track) -> MediaResult<CodedFrame> {
        if let Some(delay) = *self.read_delay.lock() {
            std::thread::sleep(delay);
        }

        let mut next = self.next_packet.lock();
        if *next >= self.packet_count() {
            return Err(MediaError::EndOfStream);
        }
        let index = *next;
        *next += 1;

        let start = index * self.frames_per_packet;
        let frames = self.frames_per_packet.min(self.total_frames - start);
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&(frames as u32).to_le_bytes());
        data.extend_from_slice(&self.amplitude.to_le_bytes());

        Ok(CodedFrame {
            timestamp: frames_to_duration(start, self.spec.sample_rate),
            duration: Some(frames_to_duration(frames, self.spec.sample_rate)),
            data,
            is_keyframe: index % self.keyframe_interval == 0,
        })
    }

    fn seek_to_most_recent_keyframe(
        &self,
        _track: Track,
        timestamp: Duration,
        scope: SeekScope,
    ) -> MediaResult<Option<Duration>> {
        match scope {
            SeekScope::Track => {
                self.track_seeks.fetch_add(1, Ordering::SeqCst);
                if self.reject_track_seeks.load(Ordering::SeqCst) {
                    return Err(MediaError::Unsupported("per-track seeking".to_string()));
                }
            }
            SeekScope::Container => {
                self.container_seeks.fetch_add(1, Ordering::SeqCst);
            }
        }

        let target = duration_to_frames(timestamp, self.spec.sample_rate);
        if target >= self.total_frames {
            return Err(MediaError::EndOfStream);
        }
        let packet = target / self.frames_per_packet;
        let keyframe = packet - packet % self.keyframe_interval;

        let mut next = self.next_packet.lock();
        if *next == keyframe {
            return Ok(None);
        }
        *next = keyframe;
        Ok(Some(frames_to_duration(
            keyframe * self.frames_per_packet,
            self.spec.sample_rate,
        )))
    }

    fn codec_id_for_track(&self, _track: Track) -> MediaResult<CodecId> {
        Ok(CodecId("fixture".to_string()))
    }

    fn codec_initialization_data_for_track(&self, _track: Track) -> MediaResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn duration_of_track(&self, _track: Track) -> MediaResult<Option<Duration>> {
        Ok(Some(frames_to_duration(self.total_frames, self.spec.sample_rate)))
    }
}

/// Counters a test can watch after the decoder has moved into a worker
#[derive(Default)]
pub struct DecoderProbe {
    pub blocks_produced: AtomicUsize,
    pub flushes: AtomicUsize,
}

/// Expands fixture packets into constant-amplitude blocks
pub struct FixtureDecoder {
    spec: SampleSpecification,
    pending: VecDeque<AudioBlock>,
    end_of_stream: bool,
    /// 1-based block number that fails, once
    fail_at_block: Option<usize>,
    failed: bool,
    blocks_per_packet: u64,
    produced: usize,
    probe: Arc<DecoderProbe>,
}

impl FixtureDecoder {
    pub fn new(spec: SampleSpecification) -> Self {
        Self {
            spec,
            pending: VecDeque::new(),
            end_of_stream: false,
            fail_at_block: None,
            failed: false,
            blocks_per_packet: 1,
            produced: 0,
            probe: Arc::new(DecoderProbe::default()),
        }
    }

    pub fn failing_at_block(mut self, block: usize) -> Self {
        self.fail_at_block = Some(block);
        self
    }

    /// Split every packet into `count` consecutive blocks
    pub fn with_blocks_per_packet(mut self, count: u64) -> Self {
        self.blocks_per_packet = count.max(1);
        self
    }

    pub fn probe(&self) -> Arc<DecoderProbe> {
        Arc::clone(&self.probe)
    }
}

impl AudioDecoder for FixtureDecoder {
    fn receive_coded_data(&mut self, timestamp: Duration, data: &[u8]) -> MediaResult<()> {
        if data.len() != 8 {
            return Err(MediaError::InvalidData("fixture packet must be 8 bytes".to_string()));
        }
        let frames = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64;
        let amplitude = f32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let start = duration_to_frames(timestamp, self.spec.sample_rate);

        let chunk = frames.div_ceil(self.blocks_per_packet).max(1);
        let mut offset = 0;
        while offset < frames {
            let count = chunk.min(frames - offset);
            let samples = vec![amplitude; count as usize * self.spec.channel_count()];
            self.pending
                .push_back(AudioBlock::new(self.spec, start + offset, samples));
            offset += count;
        }
        Ok(())
    }

    fn write_next_block(&mut self) -> MediaResult<AudioBlock> {
        if self.pending.is_empty() {
            return Err(if self.end_of_stream {
                MediaError::EndOfStream
            } else {
                MediaError::NeedsMoreInput
            });
        }
        if !self.failed && self.fail_at_block == Some(self.produced + 1) {
            self.failed = true;
            self.pending.clear();
            return Err(MediaError::Decoder("injected failure".to_string()));
        }
        self.produced += 1;
        self.probe.blocks_produced.fetch_add(1, Ordering::SeqCst);
        self.pending
            .pop_front()
            .ok_or(MediaError::NeedsMoreInput)
    }

    fn signal_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.end_of_stream = false;
        self.probe.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Worker over a fresh fixture pair
pub fn fixture_worker(
    track: Track,
    demuxer: Arc<FixtureDemuxer>,
    decoder: FixtureDecoder,
    dispatcher: Dispatcher,
    capacity: usize,
) -> DecodeWorker {
    DecodeWorker::new(track, demuxer, Box::new(decoder), dispatcher, capacity)
        .expect("spawn decode worker")
}

/// Playback stream driven by the test: it renders only when told to and its
/// clock moves only when set
pub struct ManualStream {
    data_callback: Mutex<DataCallback>,
    on_spec_negotiated: SpecNegotiatedCallback,
    spec: Mutex<Option<SampleSpecification>>,
    state: Mutex<OutputState>,
    clock: Mutex<Duration>,
    volume: Mutex<f64>,
    suspend_delay: Option<Duration>,
    resume_delay: Option<Duration>,
    pub drains: AtomicUsize,
    pub discards: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl ManualStream {
    /// Report the device specification to the sink
    pub fn negotiate(&self, spec: SampleSpecification) {
        *self.spec.lock() = Some(spec);
        (self.on_spec_negotiated)(spec);
    }

    /// Run the data callback for `frames` frames and return what it wrote
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let channels = self.spec.lock().map(|s| s.channel_count()).unwrap_or(1);
        let mut buffer = vec![f32::NAN; frames * channels];
        (self.data_callback.lock())(&mut buffer);
        buffer
    }

    pub fn set_clock(&self, time: Duration) {
        *self.clock.lock() = time;
    }

    pub fn state(&self) -> OutputState {
        *self.state.lock()
    }

    pub fn volume(&self) -> f64 {
        *self.volume.lock()
    }

    fn suspend(&self) -> StreamFuture<Duration> {
        *self.state.lock() = OutputState::Suspended;
        let clock = *self.clock.lock();
        let delay = self.suspend_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(clock)
        }
        .boxed()
    }
}

impl PlaybackStream for ManualStream {
    fn resume(&self) -> StreamFuture<Duration> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = OutputState::Playing;
        let clock = *self.clock.lock();
        let delay = self.resume_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(clock)
        }
        .boxed()
    }

    fn drain_buffer_and_suspend(&self) -> StreamFuture<Duration> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        self.suspend()
    }

    fn discard_buffer_and_suspend(&self) -> StreamFuture<Duration> {
        self.discards.fetch_add(1, Ordering::SeqCst);
        self.suspend()
    }

    fn set_volume(&self, volume: f64) -> StreamFuture<()> {
        *self.volume.lock() = volume;
        futures::future::ready(Ok(())).boxed()
    }

    fn total_time_played(&self) -> Duration {
        *self.clock.lock()
    }
}

/// Backend handing out [`ManualStream`]s
#[derive(Default)]
pub struct ManualBackend {
    /// Negotiate this spec as soon as a stream is created
    pub auto_negotiate: Option<SampleSpecification>,
    /// Fail this many creation attempts before succeeding
    pub failures_remaining: AtomicUsize,
    pub suspend_delay: Option<Duration>,
    pub resume_delay: Option<Duration>,
    pub attempts: AtomicUsize,
    streams: Mutex<Vec<Arc<ManualStream>>>,
    requests: Mutex<Vec<(OutputState, f64)>>,
}

impl ManualBackend {
    pub fn negotiating(spec: SampleSpecification) -> Self {
        Self {
            auto_negotiate: Some(spec),
            ..Default::default()
        }
    }

    /// Make every suspend take `delay` to complete
    pub fn with_suspend_delay(mut self, delay: Duration) -> Self {
        self.suspend_delay = Some(delay);
        self
    }

    /// Make every resume take `delay` to complete
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = Some(delay);
        self
    }

    pub fn stream(&self) -> Arc<ManualStream> {
        self.streams.lock().last().cloned().expect("no stream created")
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// (initial state, volume) of every successful request
    pub fn requests(&self) -> Vec<(OutputState, f64)> {
        self.requests.lock().clone()
    }
}

impl PlaybackBackend for ManualBackend {
    fn create_stream(&self, request: StreamRequest) -> Result<Arc<dyn PlaybackStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Stream("device unavailable".to_string()));
        }

        self.requests.lock().push((request.initial_state, request.volume));
        let stream = Arc::new(ManualStream {
            data_callback: Mutex::new(request.data_callback),
            on_spec_negotiated: request.on_spec_negotiated,
            spec: Mutex::new(None),
            state: Mutex::new(request.initial_state),
            clock: Mutex::new(Duration::ZERO),
            volume: Mutex::new(request.volume),
            suspend_delay: self.suspend_delay,
            resume_delay: self.resume_delay,
            drains: AtomicUsize::new(0),
            discards: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        });
        if let Some(spec) = self.auto_negotiate {
            stream.negotiate(spec);
        }
        self.streams.lock().push(Arc::clone(&stream));
        let stream: Arc<dyn PlaybackStream> = stream;
        Ok(stream)
    }
}
