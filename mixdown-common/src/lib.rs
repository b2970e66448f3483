//! # Mixdown Common Library
//!
//! Shared code for the mixdown workspace:
//! - Audio value types flowing through the pipeline (`AudioBlock`, `SampleSpecification`)
//! - Track identification
//! - Media error taxonomy shared by demuxers and decoders
//! - Frame/time conversions
//! - Configuration loading

pub mod config;
pub mod error;
pub mod timing;
pub mod types;

pub use config::MixdownConfig;
pub use error::{Error, MediaError, MediaResult, Result};
pub use types::{AudioBlock, ChannelLayout, MediaKind, SampleSpecification, Track};
