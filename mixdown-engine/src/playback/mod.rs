//! Decode workers and the mixing sink

pub mod cursor;
pub mod decode_worker;
pub mod queue;
pub mod sink;
pub mod transport;

pub use cursor::{mix_track, MixOutcome, TrackMixingCursor};
pub use decode_worker::{DecodeWorker, ErrorHandler, SeekCallback};
pub use queue::BlockQueue;
pub use sink::{MixStatistics, MixingSink};
pub use transport::TransportAnchor;
