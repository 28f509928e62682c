//! Virtual camera frame pipeline
//!
//! Moves frames from a single producer to capture clients at a fixed rate:
//! - Double-buffered input slot, latest frame wins
//! - Format negotiation with cached conversion flags
//! - BT.601 colourspace conversion and nearest-neighbour scaling (rayon rows)
//! - Output queue with a lock-free free-buffer pool
//! - One submitter thread per device, paced by a crossbeam ticker

pub mod config;
pub mod device;
pub mod error;
pub mod format_conversion;
pub mod input_slot;
pub mod negotiator;
pub mod output_queue;
pub mod stats;
pub mod submitter;
pub mod types;

pub use config::{DeviceSpec, IdlePolicy, SOURCE_NAME_MAX_LEN};
pub use device::{create_device, destroy_device, Device, DeviceState, FrameSource};
pub use error::{Result, VcamError};
pub use format_conversion::{convert_frame, is_supported, FrameConverter};
pub use input_slot::{InputBuffer, InputSlot, ReadyFrame, SlotRef};
pub use negotiator::{ConversionFlags, FormatNegotiator, Negotiated};
pub use output_queue::{OutputBuffer, OutputQueue, MAX_OUTPUT_BUFFERS};
pub use stats::DeviceStats;
pub use submitter::TickOutcome;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Rgb24.frame_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::Yuyv.frame_size(640, 480), 640 * 480 * 2);
        assert_eq!(PixelFormat::Nv12.frame_size(640, 480), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_identity_round_trip_through_converter() {
        let desc = FormatDescriptor::new(PixelFormat::Uyvy, 32, 16);
        let frame: Vec<u8> = (0..desc.frame_size()).map(|i| (i * 7) as u8).collect();
        assert_eq!(convert_frame(&frame, &desc, &desc).unwrap(), frame);
    }
}
