//! Device creation parameters

use crate::error::{Result, VcamError};
use crate::types::{FrameInterval, PixelFormat, MAX_FORMATS};

/// Longest accepted frame-source endpoint name, in bytes
pub const SOURCE_NAME_MAX_LEN: usize = 16;

/// What the submitter does on a tick with no fresh input frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Deliver nothing and leave the frame counter alone
    #[default]
    Skip,
    /// Deliver the last frame again to keep the output stream continuous
    RepeatLast,
}

/// Everything needed to create a device
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Device number, used in thread and endpoint names
    pub index: usize,
    /// Output formats advertised to capture clients (at most `MAX_FORMATS`)
    pub supported_formats: Vec<PixelFormat>,
    pub width: u32,
    pub height: u32,
    /// Encoding the frame source writes
    pub input_format: PixelFormat,
    /// Initial output encoding; the first supported format when `None`
    pub output_format: Option<PixelFormat>,
    pub frame_interval: FrameInterval,
    pub idle_policy: IdlePolicy,
    /// Input buffer size override; the input frame size when `None`
    pub input_capacity: Option<usize>,
    /// Pin the submitter thread to this CPU
    pub submitter_cpu: Option<usize>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            index: 0,
            supported_formats: vec![PixelFormat::Rgb24, PixelFormat::Yuyv],
            width: 640,
            height: 480,
            input_format: PixelFormat::Rgb24,
            output_format: None,
            frame_interval: FrameInterval::from_fps(30),
            idle_policy: IdlePolicy::Skip,
            input_capacity: None,
            submitter_cpu: None,
        }
    }
}

impl DeviceSpec {
    /// 640x480 @ 30fps
    pub fn vga() -> Self {
        Self::default()
    }

    /// 1280x720 @ 30fps
    pub fn hd_720p() -> Self {
        Self {
            width: 1280,
            height: 720,
            ..Default::default()
        }
    }

    pub fn source_name(&self) -> String {
        format!("vcamfb{}", self.index)
    }

    pub fn thread_name(&self) -> String {
        format!("vcam{}-submitter", self.index)
    }

    /// Checks that do not depend on allocating anything
    pub fn validate(&self) -> Result<()> {
        if self.supported_formats.is_empty() || self.supported_formats.len() > MAX_FORMATS {
            return Err(VcamError::Creation(format!(
                "{} output formats given, expected 1..={}",
                self.supported_formats.len(),
                MAX_FORMATS
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(VcamError::Creation(format!(
                "empty resolution {}x{}",
                self.width, self.height
            )));
        }
        if !self.frame_interval.is_valid() {
            return Err(VcamError::Creation(format!(
                "invalid frame interval {}",
                self.frame_interval
            )));
        }
        if self.source_name().len() > SOURCE_NAME_MAX_LEN {
            return Err(VcamError::Creation(format!(
                "device index {} does not fit the endpoint name",
                self.index
            )));
        }
        if self.input_capacity == Some(0) {
            return Err(VcamError::Creation("input capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}
