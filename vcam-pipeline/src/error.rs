//! Error taxonomy for the frame pipeline
//!
//! "No frame available" is deliberately absent: it is the expected idle
//! condition and is reported as `None` or [`crate::TickOutcome::NoFrameAvailable`].

use crate::types::PixelFormat;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VcamError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VcamError {
    /// Submitted or converted frame has an unusable length
    #[error("invalid frame of {len} bytes (expected at most {expected})")]
    InvalidFrame { len: usize, expected: usize },

    /// Negotiation rejected, the previous formats stay in effect
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// No mapping exists between the two encodings
    #[error("no conversion from {from} to {to}")]
    ConversionUnsupported { from: PixelFormat, to: PixelFormat },

    /// Every client buffer is either filled or dequeued
    #[error("no free output buffer")]
    OutputQueueBackpressure,

    /// Device construction failed and was rolled back
    #[error("device creation failed: {0}")]
    Creation(String),

    /// A frame source is already attached, or a second producer raced the first
    #[error("frame source busy")]
    SourceBusy,

    #[error("device is stopping or stopped")]
    DeviceStopped,
}
