//! mixdown-play - Main entry point
//!
//! Plays one or more audio files at once, mixed into a single output stream.
//! Each file contributes its first audio track. Stops when every track has
//! played out or failed, or on Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mixdown_common::MixdownConfig;
use mixdown_engine::audio::CpalBackend;
use mixdown_engine::media::{Demuxer, SymphoniaDecoder, SymphoniaDemuxer};
use mixdown_engine::{DecodeWorker, EventLoop, MixingSink};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often playback progress is logged and end-of-stream checked
const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line arguments for mixdown-play
#[derive(Parser, Debug)]
#[command(name = "mixdown-play")]
#[command(about = "Mix and play audio files through one output stream")]
#[command(version)]
struct Args {
    /// Configuration file (overrides MIXDOWN_CONFIG and the default location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output device name (overrides the configuration file)
    #[arg(short, long, env = "MIXDOWN_DEVICE")]
    device: Option<String>,

    /// Linear output gain
    #[arg(long, default_value = "1.0")]
    volume: f64,

    /// Start position in seconds
    #[arg(long, default_value = "0")]
    start: f64,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Audio files to mix
    #[arg(required_unless_present = "list_devices")]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = MixdownConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_devices {
        for name in CpalBackend::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    if !(args.start.is_finite() && args.start >= 0.0) {
        bail!("--start must be a non-negative number of seconds");
    }

    // Completions are marshalled onto this thread, so a single-threaded runtime
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(play(args, config))
}

async fn play(args: Args, config: MixdownConfig) -> Result<()> {
    let mut event_loop = EventLoop::new();

    let mut sources = Vec::new();
    for path in &args.files {
        let demuxer = SymphoniaDemuxer::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let track = demuxer
            .default_audio_track()
            .with_context(|| format!("No audio track in {}", path.display()))?;
        sources.push((path.clone(), Arc::new(demuxer), track));
    }

    let mut output = config.output.clone();
    if args.device.is_some() {
        output.device = args.device.clone();
    }
    let mut backend = CpalBackend::from_settings(&output);
    if let Some((_, demuxer, track)) = sources.first() {
        if let Some(spec) = demuxer.sample_specification(*track)? {
            backend = backend.with_preferred_spec(spec);
        }
    }

    let sink = MixingSink::new(
        Arc::new(backend),
        event_loop.dispatcher(),
        config.sink.target_latency(),
    );
    sink.set_volume(args.volume).await?;

    let mut longest = Duration::ZERO;
    for (index, (path, demuxer, file_track)) in sources.into_iter().enumerate() {
        let decoder = SymphoniaDecoder::for_track(&demuxer, file_track)?;
        if let Some(duration) = demuxer.duration_of_track(file_track)? {
            longest = longest.max(duration);
        }
        info!(
            "{}: {} ({})",
            path.display(),
            demuxer.codec_id_for_track(file_track)?,
            file_track
        );

        // Tracks from different files may share ids, so the sink keys them by file
        let track = mixdown_common::Track::audio(index as u64);
        let worker = DecodeWorker::new(
            file_track,
            demuxer,
            Box::new(decoder),
            event_loop.dispatcher(),
            config.sink.queue_capacity,
        )?;
        let name = path.display().to_string();
        worker.set_error_handler(move |e| error!("{}: playback stopped: {}", name, e));
        sink.attach(track, worker)?;

        if args.start > 0.0 {
            let start = Duration::from_secs_f64(args.start);
            sink.seek(track, start, move || info!("Track {} positioned at {:?}", index, start))?;
        }
    }

    if args.start > 0.0 {
        sink.set_time(Duration::from_secs_f64(args.start)).await?;
    }
    sink.resume().await?;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = event_loop.next() => {}
            _ = status.tick() => {
                let now = sink.current_time();
                info!("Position {:.1}s / {:.1}s", now.as_secs_f64(), longest.as_secs_f64());
                if sink.all_tracks_ended() {
                    let failed = sink.failed_tracks();
                    if failed.is_empty() {
                        info!("All tracks finished");
                    } else {
                        warn!("Finished with {} failed track(s): {:?}", failed.len(), failed);
                    }
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.pause().await {
        warn!("Failed to drain output: {}", e);
    }

    let stats = sink.statistics();
    info!(
        "Played {} frames in {} callbacks ({} underruns, {} discarded blocks)",
        stats.frames_written, stats.callbacks, stats.underruns, stats.discarded_blocks
    );
    Ok(())
}
