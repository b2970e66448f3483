//! Demuxer and decoder built on symphonia
//!
//! Decodes various audio formats (MP3, FLAC, AAC, Vorbis, WAV) to f32 PCM.
//!
//! [`SymphoniaDemuxer`] wraps one symphonia `FormatReader`. Several tracks of
//! the same file may be read through it at once, so packets read for one
//! track while looking for another are parked per track until asked for.
//!
//! [`SymphoniaDecoder`] decodes each packet as it arrives and hands out the
//! result as [`AudioBlock`]s positioned in frames at the track's own rate. It
//! does not resample or remix channels.

use super::{AudioDecoder, CodecId, CodedFrame, Demuxer, SeekScope};
use mixdown_common::timing::duration_to_frames;
use mixdown_common::{AudioBlock, ChannelLayout, MediaError, MediaResult, SampleSpecification, Track};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, trace, warn};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

fn map_error(err: SymphoniaError) -> MediaError {
    match err {
        SymphoniaError::IoError(e) => MediaError::from(e),
        SymphoniaError::DecodeError(msg) => MediaError::InvalidData(msg.to_string()),
        SymphoniaError::SeekError(SeekErrorKind::OutOfRange) => MediaError::EndOfStream,
        SymphoniaError::SeekError(kind) => MediaError::Demuxer(format!("seek failed: {:?}", kind)),
        SymphoniaError::Unsupported(msg) => MediaError::Unsupported(msg.to_string()),
        SymphoniaError::LimitError(msg) => MediaError::InvalidData(format!("limit exceeded: {}", msg)),
        SymphoniaError::ResetRequired => {
            MediaError::Unsupported("stream parameters changed mid-stream".to_string())
        }
        #[allow(unreachable_patterns)]
        other => MediaError::Demuxer(other.to_string()),
    }
}

/// Timestamp in `time_base` units to a duration, rounded up to the next
/// nanosecond so converting back to frames at the track rate is exact
fn timestamp_to_duration(ts: u64, time_base: TimeBase) -> Duration {
    let denom = time_base.denom.max(1) as u128;
    let nanos = (ts as u128 * time_base.numer as u128 * NANOS_PER_SECOND + denom - 1) / denom;
    Duration::new((nanos / NANOS_PER_SECOND) as u64, (nanos % NANOS_PER_SECOND) as u32)
}

struct TrackInfo {
    id: u32,
    params: CodecParameters,
    time_base: TimeBase,
}

struct ReaderState {
    reader: Box<dyn FormatReader>,
    /// Packets read ahead for tracks other than the one being asked for
    parked: HashMap<u32, VecDeque<Packet>>,
    /// Tracks someone has read from; only these get packets parked
    active: HashSet<u32>,
}

/// Container reader over a symphonia `FormatReader`
pub struct SymphoniaDemuxer {
    state: Mutex<ReaderState>,
    tracks: Vec<TrackInfo>,
}

impl SymphoniaDemuxer {
    /// Probe and open a file
    pub fn open(path: &Path) -> MediaResult<Self> {
        debug!("Opening {}", path.display());
        let file = std::fs::File::open(path)
            .map_err(|e| MediaError::Io(format!("Failed to open file {}: {}", path.display(), e)))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        Self::from_source(Box::new(file), hint)
    }

    /// Probe any media source
    pub fn from_source(source: Box<dyn MediaSource>, hint: Hint) -> MediaResult<Self> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(msg) => {
                    MediaError::Unsupported(format!("Failed to probe format: {}", msg))
                }
                other => map_error(other),
            })?;

        let reader = probed.format;
        let tracks: Vec<TrackInfo> = reader
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .map(|t| {
                let params = t.codec_params.clone();
                let time_base = params.time_base.unwrap_or_else(|| {
                    TimeBase::new(1, params.sample_rate.unwrap_or(1))
                });
                TrackInfo {
                    id: t.id,
                    params,
                    time_base,
                }
            })
            .collect();

        if tracks.is_empty() {
            return Err(MediaError::Unsupported("No audio track found".to_string()));
        }
        debug!("Found {} audio track(s)", tracks.len());

        Ok(Self {
            state: Mutex::new(ReaderState {
                reader,
                parked: HashMap::new(),
                active: HashSet::new(),
            }),
            tracks,
        })
    }

    pub fn audio_tracks(&self) -> Vec<Track> {
        self.tracks.iter().map(|t| Track::audio(t.id as u64)).collect()
    }

    /// First audio track in the container
    pub fn default_audio_track(&self) -> Option<Track> {
        self.tracks.first().map(|t| Track::audio(t.id as u64))
    }

    pub fn codec_parameters(&self, track: Track) -> MediaResult<CodecParameters> {
        Ok(self.info(track)?.params.clone())
    }

    /// Native sample specification of `track`, if the container declares it
    pub fn sample_specification(&self, track: Track) -> MediaResult<Option<SampleSpecification>> {
        let params = &self.info(track)?.params;
        Ok(match (params.sample_rate, params.channels) {
            (Some(rate), Some(channels)) => Some(SampleSpecification::new(
                rate,
                ChannelLayout::from_count(channels.count() as u16),
            )),
            _ => None,
        })
    }

    fn info(&self, track: Track) -> MediaResult<&TrackInfo> {
        self.tracks
            .iter()
            .find(|t| t.id as u64 == track.id)
            .ok_or_else(|| MediaError::Demuxer(format!("{} is not an audio track of this file", track)))
    }

    fn coded_frame(info: &TrackInfo, packet: Packet) -> CodedFrame {
        let duration = match packet.dur() {
            0 => None,
            dur => Some(timestamp_to_duration(dur, info.time_base)),
        };
        CodedFrame {
            timestamp: timestamp_to_duration(packet.ts(), info.time_base),
            duration,
            // Symphonia only exposes packets that start a decodable unit
            is_keyframe: true,
            data: packet.data.into_vec(),
        }
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn next_sample_for_track(&self, track: Track) -> MediaResult<CodedFrame> {
        let info = self.info(track)?;
        let mut state = self.state.lock();
        state.active.insert(info.id);

        if let Some(packet) = state.parked.get_mut(&info.id).and_then(VecDeque::pop_front) {
            return Ok(Self::coded_frame(info, packet));
        }

        loop {
            let packet = state.reader.next_packet().map_err(map_error)?;
            if packet.track_id() == info.id {
                return Ok(Self::coded_frame(info, packet));
            }
            if state.active.contains(&packet.track_id()) {
                state.parked.entry(packet.track_id()).or_default().push_back(packet);
            }
        }
    }

    fn seek_to_most_recent_keyframe(
        &self,
        track: Track,
        timestamp: Duration,
        scope: SeekScope,
    ) -> MediaResult<Option<Duration>> {
        let info = self.info(track)?;
        let time = Time::new(timestamp.as_secs(), timestamp.subsec_nanos() as f64 / 1e9);
        let track_id = match scope {
            SeekScope::Track => Some(info.id),
            SeekScope::Container => None,
        };

        let mut state = self.state.lock();
        let seeked = state
            .reader
            .seek(SeekMode::Accurate, SeekTo::Time { time, track_id })
            .map_err(map_error)?;
        state.parked.clear();

        let position = timestamp_to_duration(seeked.actual_ts, info.time_base);
        trace!("{} seek to {:?} landed at {:?}", track, timestamp, position);
        Ok(Some(position))
    }

    fn codec_id_for_track(&self, track: Track) -> MediaResult<CodecId> {
        let codec = self.info(track)?.params.codec;
        let name = symphonia::default::get_codecs()
            .get_codec(codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| format!("{:?}", codec));
        Ok(CodecId(name))
    }

    fn codec_initialization_data_for_track(&self, track: Track) -> MediaResult<Vec<u8>> {
        Ok(self
            .info(track)?
            .params
            .extra_data
            .as_ref()
            .map(|d| d.to_vec())
            .unwrap_or_default())
    }

    fn duration_of_track(&self, track: Track) -> MediaResult<Option<Duration>> {
        let info = self.info(track)?;
        Ok(info
            .params
            .n_frames
            .map(|frames| timestamp_to_duration(frames, info.time_base)))
    }
}

/// Packet decoder over a symphonia codec
pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    pending: VecDeque<AudioBlock>,
    end_of_stream: bool,
}

impl SymphoniaDecoder {
    pub fn new(track: Track, params: &CodecParameters) -> MediaResult<Self> {
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| MediaError::Unsupported("Sample rate not found".to_string()))?;

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| MediaError::Unsupported(format!("Failed to create decoder: {}", e)))?;

        Ok(Self {
            decoder,
            track_id: track.id as u32,
            sample_rate,
            pending: VecDeque::new(),
            end_of_stream: false,
        })
    }

    /// Decoder for one track of an open demuxer
    pub fn for_track(demuxer: &SymphoniaDemuxer, track: Track) -> MediaResult<Self> {
        Self::new(track, &demuxer.codec_parameters(track)?)
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn receive_coded_data(&mut self, timestamp: Duration, data: &[u8]) -> MediaResult<()> {
        let start_frame = duration_to_frames(timestamp, self.sample_rate);
        let packet = Packet::new_from_slice(self.track_id, start_frame, 0, data);

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                // Corrupt packets are skipped, the stream carries on
                warn!("Skipping undecodable packet at {:?}: {}", timestamp, msg);
                return Ok(());
            }
            Err(e) => return Err(map_error(e)),
        };

        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }

        let signal_spec = *decoded.spec();
        let spec = SampleSpecification::new(
            signal_spec.rate,
            ChannelLayout::from_count(signal_spec.channels.count() as u16),
        );
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, signal_spec);
        buffer.copy_interleaved_ref(decoded);

        self.pending
            .push_back(AudioBlock::new(spec, start_frame, buffer.samples().to_vec()));
        Ok(())
    }

    fn write_next_block(&mut self) -> MediaResult<AudioBlock> {
        match self.pending.pop_front() {
            Some(block) => Ok(block),
            None if self.end_of_stream => Err(MediaError::EndOfStream),
            None => Err(MediaError::NeedsMoreInput),
        }
    }

    fn signal_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    fn flush(&mut self) {
        self.decoder.reset();
        self.pending.clear();
        self.end_of_stream = false;
    }
}
