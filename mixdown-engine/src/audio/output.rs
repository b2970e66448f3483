//! Audio output using cpal
//!
//! [`CpalBackend`] opens streams on a cpal output device.
//!
//! `cpal::Stream` cannot leave the thread that built it, so each
//! [`CpalPlaybackStream`] runs a small device thread that owns the stream and
//! executes transport commands sent over a channel. Replies come back on
//! oneshot channels, which is what makes the transport futures `Send`.
//!
//! **Device selection:** a named device falls back to the default device if
//! it is missing. The stream configuration prefers the caller's sample
//! specification in f32, and otherwise takes the device default.

use super::stream::{
    DataCallback, OutputState, PlaybackBackend, PlaybackStream, StreamFuture, StreamRequest,
};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use futures::FutureExt;
use mixdown_common::config::OutputSettings;
use mixdown_common::timing::frames_to_duration;
use mixdown_common::{ChannelLayout, SampleSpecification};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Opens cpal output streams
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
    buffer_size: Option<u32>,
    preferred_spec: Option<SampleSpecification>,
}

impl CpalBackend {
    /// # Arguments
    /// - `device_name`: Optional device name (None = default device)
    /// - `buffer_size`: Optional buffer size in frames (None = device default)
    pub fn new(device_name: Option<String>, buffer_size: Option<u32>) -> Self {
        Self {
            device_name,
            buffer_size,
            preferred_spec: None,
        }
    }

    pub fn from_settings(settings: &OutputSettings) -> Self {
        Self::new(settings.device.clone(), settings.buffer_size_frames)
    }

    /// Ask for this specification if the device supports it
    pub fn with_preferred_spec(mut self, spec: SampleSpecification) -> Self {
        self.preferred_spec = Some(spec);
        self
    }

    /// List available audio output devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }
}

impl PlaybackBackend for CpalBackend {
    fn create_stream(&self, request: StreamRequest) -> Result<Arc<dyn PlaybackStream>> {
        let stream: Arc<dyn PlaybackStream> = Arc::new(CpalPlaybackStream::open(self.clone(), request)?);
        Ok(stream)
    }
}

/// State shared between the stream handle, device thread and audio callback
struct StreamShared {
    /// f32 bits of the linear gain
    volume: AtomicU32,
    frames_played: AtomicU64,
    sample_rate: AtomicU32,
    error_count: AtomicU32,
}

impl StreamShared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f64) {
        self.volume.store((volume as f32).to_bits(), Ordering::Relaxed);
    }

    fn time_played(&self) -> Duration {
        match self.sample_rate.load(Ordering::Acquire) {
            0 => Duration::ZERO,
            rate => frames_to_duration(self.frames_played.load(Ordering::Acquire), rate),
        }
    }
}

enum DeviceCommand {
    Resume(oneshot::Sender<Result<Duration>>),
    Suspend {
        drain: bool,
        reply: oneshot::Sender<Result<Duration>>,
    },
    Shutdown,
}

/// A cpal stream driven from its own device thread
pub struct CpalPlaybackStream {
    shared: Arc<StreamShared>,
    commands: mpsc::Sender<DeviceCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalPlaybackStream {
    /// Open the device and build the stream. Returns once the stream exists
    /// (or failed to), reporting the negotiated specification through the
    /// request's callback.
    pub fn open(backend: CpalBackend, request: StreamRequest) -> Result<Self> {
        let shared = Arc::new(StreamShared {
            volume: AtomicU32::new((request.volume as f32).to_bits()),
            frames_played: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
        });

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || device_thread(backend, request, thread_shared, ready_tx, command_rx))?;

        match ready_rx.recv() {
            Ok(Ok(spec)) => {
                info!("Audio stream opened at {}", spec);
                Ok(Self {
                    shared,
                    commands,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::AudioOutput("Audio device thread exited during setup".to_string()))
            }
        }
    }

    /// Errors reported by the device since the stream opened
    pub fn error_count(&self) -> u32 {
        self.shared.error_count.load(Ordering::Relaxed)
    }

    fn send(&self, command: DeviceCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Stream("audio device thread is gone".to_string()))
    }

    fn transport_command<F>(&self, make: F) -> StreamFuture<Duration>
    where
        F: FnOnce(oneshot::Sender<Result<Duration>>) -> DeviceCommand,
    {
        let (reply, rx) = oneshot::channel();
        let sent = self.send(make(reply));
        async move {
            sent?;
            rx.await
                .map_err(|_| Error::Stream("audio device thread dropped the request".to_string()))?
        }
        .boxed()
    }
}

impl PlaybackStream for CpalPlaybackStream {
    fn resume(&self) -> StreamFuture<Duration> {
        self.transport_command(DeviceCommand::Resume)
    }

    fn drain_buffer_and_suspend(&self) -> StreamFuture<Duration> {
        self.transport_command(|reply| DeviceCommand::Suspend { drain: true, reply })
    }

    fn discard_buffer_and_suspend(&self) -> StreamFuture<Duration> {
        self.transport_command(|reply| DeviceCommand::Suspend { drain: false, reply })
    }

    fn set_volume(&self, volume: f64) -> StreamFuture<()> {
        self.shared.set_volume(volume);
        futures::future::ready(Ok(())).boxed()
    }

    fn total_time_played(&self) -> Duration {
        self.shared.time_played()
    }
}

impl Drop for CpalPlaybackStream {
    fn drop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if let Err(e) = handle.join() {
                error!("Audio device thread panicked: {:?}", e);
            }
        }
        debug!("Audio stream closed");
    }
}

fn device_thread(
    backend: CpalBackend,
    request: StreamRequest,
    shared: Arc<StreamShared>,
    ready: mpsc::Sender<Result<SampleSpecification>>,
    commands: mpsc::Receiver<DeviceCommand>,
) {
    let StreamRequest {
        initial_state,
        target_latency,
        on_spec_negotiated,
        data_callback,
        ..
    } = request;

    let opened = open_device(&backend).and_then(|(device, config, format)| {
        let spec = SampleSpecification::new(
            config.sample_rate.0,
            ChannelLayout::from_count(config.channels),
        );
        shared.sample_rate.store(spec.sample_rate, Ordering::Release);
        let stream = build_stream(&device, &config, format, data_callback, Arc::clone(&shared))?;
        if initial_state == OutputState::Playing {
            stream
                .play()
                .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;
        }
        Ok((stream, spec))
    });

    let stream = match opened {
        Ok((stream, spec)) => {
            let _ = ready.send(Ok(spec));
            on_spec_negotiated(spec);
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Resume(reply) => {
                let result = stream
                    .play()
                    .map(|()| shared.time_played())
                    .map_err(|e| Error::Stream(format!("Failed to resume stream: {}", e)));
                let _ = reply.send(result);
            }
            DeviceCommand::Suspend { drain, reply } => {
                if drain {
                    // Let the device play out what it already holds
                    thread::sleep(target_latency);
                }
                let result = stream
                    .pause()
                    .map(|()| shared.time_played())
                    .map_err(|e| Error::Stream(format!("Failed to pause stream: {}", e)));
                let _ = reply.send(result);
            }
            DeviceCommand::Shutdown => break,
        }
    }

    drop(stream);
    debug!("Audio device thread exiting");
}

/// Find the device and pick a configuration.
/// Falls back to the default device if the named one is missing.
fn open_device(backend: &CpalBackend) -> Result<(Device, StreamConfig, SampleFormat)> {
    let host = cpal::default_host();

    let device = if let Some(name) = backend.device_name.as_ref() {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;

        match devices.find(|d| d.name().ok().as_ref() == Some(name)) {
            Some(dev) => {
                info!("Found requested audio device: {}", name);
                dev
            }
            None => {
                warn!("Requested device '{}' not found, falling back to default device", name);
                host.default_output_device().ok_or_else(|| {
                    Error::AudioOutput(format!(
                        "Device '{}' not found and no default device available",
                        name
                    ))
                })?
            }
        }
    } else {
        host.default_output_device()
            .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?
    };

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio device: {}", name);

    let (mut config, sample_format) = best_config(&device, backend.preferred_spec)?;

    if let Some(size) = backend.buffer_size {
        config.buffer_size = cpal::BufferSize::Fixed(size);
        debug!("Using requested buffer size: {} frames", size);
    }

    debug!(
        "Audio config: sample_rate={}, channels={}, format={:?}, buffer_size={:?}",
        config.sample_rate.0, config.channels, sample_format, config.buffer_size
    );

    Ok((device, config, sample_format))
}

/// Prefer `preferred` in f32, then `preferred` in any format, then the
/// device default.
fn best_config(
    device: &Device,
    preferred: Option<SampleSpecification>,
) -> Result<(StreamConfig, SampleFormat)> {
    if let Some(spec) = preferred {
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?
            .filter(|config| {
                config.channels() as usize == spec.channel_count()
                    && config.min_sample_rate().0 <= spec.sample_rate
                    && config.max_sample_rate().0 >= spec.sample_rate
            })
            .collect();

        let pick = supported
            .iter()
            .find(|c| c.sample_format() == SampleFormat::F32)
            .or_else(|| supported.first());

        if let Some(config) = pick {
            let sample_format = config.sample_format();
            let config = config
                .clone()
                .with_sample_rate(cpal::SampleRate(spec.sample_rate))
                .config();
            return Ok((config, sample_format));
        }
        warn!("Device does not support {}, using its default configuration", spec);
    }

    let supported_config = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;

    let sample_format = supported_config.sample_format();
    Ok((supported_config.config(), sample_format))
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    callback: DataCallback,
    shared: Arc<StreamShared>,
) -> Result<Stream> {
    match format {
        SampleFormat::F32 => build_typed_stream::<f32>(device, config, callback, shared),
        SampleFormat::I16 => build_typed_stream::<i16>(device, config, callback, shared),
        SampleFormat::U16 => build_typed_stream::<u16>(device, config, callback, shared),
        other => Err(Error::AudioOutput(format!("Unsupported sample format: {:?}", other))),
    }
}

/// Render f32 through the data callback, apply volume and clamp, then convert
/// to the device's sample type
fn build_typed_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut callback: DataCallback,
    shared: Arc<StreamShared>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as u64;
    let mut scratch: Vec<f32> = Vec::new();
    let error_shared = Arc::clone(&shared);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() != data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                callback(&mut scratch);

                let volume = shared.volume();
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = T::from_sample((sample * volume).clamp(-1.0, 1.0));
                }

                shared
                    .frames_played
                    .fetch_add(data.len() as u64 / channels, Ordering::AcqRel);
            },
            move |err| {
                error!("Audio stream error: {}", err);
                error_shared.error_count.fetch_add(1, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
}
