//! Per-track read position inside the mixer
//!
//! The mixer renders windows of `[write_position, write_position + N)` frames.
//! Each track keeps the block it is currently consuming plus an offset into
//! it; [`mix_track`] sums that track's samples for one window into the
//! output, pulling more blocks as needed.
//!
//! **Window rules:**
//! - Blocks (or parts of blocks) that end before the window are skipped
//! - A block that starts after the window is kept for a later window
//! - Gaps between blocks stay silent
//! - Blocks whose specification differs from the output are discarded

use mixdown_common::{AudioBlock, SampleSpecification};
use tracing::trace;

/// A track's position within its current block
#[derive(Debug, Default)]
pub struct TrackMixingCursor {
    block: AudioBlock,
    /// Frames of `block` already consumed
    offset: u64,
}

/// What happened while mixing one track for one window
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MixOutcome {
    /// Frames of this track summed into the output
    pub contributed_frames: u64,
    /// Blocks dropped for a specification mismatch
    pub discarded_blocks: u64,
    /// The queue ran dry before the window was covered
    pub starved: bool,
}

impl TrackMixingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current block
    pub fn reset(&mut self) {
        self.block = AudioBlock::empty();
        self.offset = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.block.frame_count()
    }

    /// Absolute frame of the next unconsumed sample
    pub fn position(&self) -> u64 {
        self.block.start_frame() + self.offset
    }

    fn load(&mut self, block: AudioBlock) {
        self.block = block;
        self.offset = 0;
    }
}

/// Sum one track into `output` for the window starting at `window_start`.
///
/// `output` is interleaved in `spec` and already holds the other tracks'
/// contribution; this track's samples are added on top. `next_block` is
/// called whenever the cursor needs more data.
pub fn mix_track<F>(
    cursor: &mut TrackMixingCursor,
    mut next_block: F,
    spec: SampleSpecification,
    window_start: u64,
    output: &mut [f32],
) -> MixOutcome
where
    F: FnMut() -> Option<AudioBlock>,
{
    let channels = spec.channel_count();
    let window_end = window_start + (output.len() / channels) as u64;
    let mut outcome = MixOutcome::default();

    loop {
        if cursor.is_exhausted() {
            match next_block() {
                Some(block) if block.spec() != spec => {
                    trace!("Discarding {} block, output is {}", block.spec(), spec);
                    outcome.discarded_blocks += 1;
                    continue;
                }
                Some(block) => cursor.load(block),
                None => {
                    outcome.starved = true;
                    break;
                }
            }
        }

        let block_end = cursor.block.end_frame();
        if block_end <= window_start {
            cursor.reset();
            continue;
        }

        let position = cursor.position();
        if position < window_start {
            cursor.offset += window_start - position;
            continue;
        }
        if position >= window_end {
            break;
        }

        let count = block_end.min(window_end) - position;
        let source = cursor.block.frame_slice(cursor.offset, count);
        let first = (position - window_start) as usize * channels;
        for (out, sample) in output[first..first + source.len()].iter_mut().zip(source) {
            *out += *sample;
        }

        cursor.offset += count;
        outcome.contributed_frames += count;
        if position + count >= window_end {
            break;
        }
    }

    outcome
}
