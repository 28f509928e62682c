//! Frame format types shared across the pipeline

use crate::error::{Result, VcamError};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::str;
use std::time::Duration;

/// Maximum number of output formats a device can advertise
pub const MAX_FORMATS: usize = 4;

/// Largest accepted frame width or height, in pixels
pub const MAX_DIMENSION: u32 = 16384;

/// Four character code identifying a pixel encoding
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FourCC {
    repr: [u8; 4],
}

impl FourCC {
    pub const fn new(repr: &[u8; 4]) -> FourCC {
        FourCC { repr: *repr }
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.repr
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match str::from_utf8(&self.repr) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:#010x}", u32::from(*self)),
        }
    }
}

impl From<u32> for FourCC {
    fn from(code: u32) -> Self {
        FourCC::new(&code.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> u32 {
        u32::from_le_bytes(fourcc.repr)
    }
}

/// Pixel encodings understood by the pipeline
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24 = 1, // Packed RGB 8:8:8
    Bgr24 = 2, // Packed BGR 8:8:8
    Yuyv = 3,  // Packed YUV 4:2:2, Y0 U Y1 V
    Uyvy = 4,  // Packed YUV 4:2:2, U Y0 V Y1
    Nv12 = 5,  // Semi-planar YUV 4:2:0 (Y plane, interleaved UV)
    Mjpeg = 6, // Compressed, only ever copied through
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Nv12,
        PixelFormat::Mjpeg,
    ];

    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.fourcc() == fourcc)
    }

    /// Human readable description, as advertised to capture clients
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB/BGR (24)",
            PixelFormat::Bgr24 => "BGR/RGB (24)",
            PixelFormat::Yuyv => "YUV 4:2:2 (YUYV)",
            PixelFormat::Uyvy => "YUV 4:2:2 (UYVY)",
            PixelFormat::Nv12 => "Y/CbCr 4:2:0 (NV12)",
            PixelFormat::Mjpeg => "Motion-JPEG",
        }
    }

    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 24,
            PixelFormat::Yuyv | PixelFormat::Uyvy => 16,
            PixelFormat::Nv12 => 12,
            PixelFormat::Mjpeg => 0,
        }
    }

    /// Returns bytes per pixel for packed formats, zero otherwise
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv | PixelFormat::Uyvy => 2,
            PixelFormat::Nv12 | PixelFormat::Mjpeg => 0,
        }
    }

    /// Horizontal chroma subsampling factor, i.e. the width must be a multiple of it
    pub fn horizontal_block(self) -> u32 {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    /// Vertical chroma subsampling factor
    pub fn vertical_block(self) -> u32 {
        match self {
            PixelFormat::Nv12 => 2,
            _ => 1,
        }
    }

    pub fn is_compressed(self) -> bool {
        self == PixelFormat::Mjpeg
    }

    pub fn bytes_per_line(self, width: u32) -> usize {
        match self {
            PixelFormat::Nv12 => width as usize,
            PixelFormat::Mjpeg => 0,
            _ => width as usize * self.bytes_per_pixel(),
        }
    }

    /// Calculate frame size in bytes (an upper bound for compressed formats)
    ///
    /// Saturates instead of overflowing; validated descriptors never get near.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let area = w.saturating_mul(h);
        match self {
            PixelFormat::Nv12 => area.saturating_add(w.saturating_mul(h / 2)),
            PixelFormat::Mjpeg => area.saturating_mul(2),
            _ => area.saturating_mul(self.bytes_per_pixel()),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

/// Pixel encoding plus geometry of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

impl FormatDescriptor {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            bit_depth: pixel_format.bit_depth(),
        }
    }

    pub fn bytes_per_line(&self) -> usize {
        self.pixel_format.bytes_per_line(self.width)
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    pub fn same_resolution(&self, other: &FormatDescriptor) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Rejects geometry the pixel layout cannot represent
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(VcamError::UnsupportedFormat(format!(
                "{} has empty resolution {}x{}",
                self.pixel_format, self.width, self.height
            )));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(VcamError::UnsupportedFormat(format!(
                "{}x{} exceeds the {} pixel limit",
                self.width, self.height, MAX_DIMENSION
            )));
        }
        if self.width % self.pixel_format.horizontal_block() != 0
            || self.height % self.pixel_format.vertical_block() != 0
        {
            return Err(VcamError::UnsupportedFormat(format!(
                "{} cannot be laid out at {}x{}",
                self.pixel_format, self.width, self.height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.pixel_format, self.width, self.height)
    }
}

/// C-compatible form of [`FormatDescriptor`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RawFormat {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

impl From<FormatDescriptor> for RawFormat {
    fn from(desc: FormatDescriptor) -> Self {
        Self {
            fourcc: desc.pixel_format.fourcc().into(),
            width: desc.width,
            height: desc.height,
            bit_depth: desc.bit_depth,
        }
    }
}

impl TryFrom<RawFormat> for FormatDescriptor {
    type Error = VcamError;

    fn try_from(raw: RawFormat) -> Result<Self> {
        let fourcc = FourCC::from(raw.fourcc);
        let pixel_format = PixelFormat::from_fourcc(fourcc)
            .ok_or_else(|| VcamError::UnsupportedFormat(format!("unknown fourcc {}", fourcc)))?;
        Ok(FormatDescriptor::new(pixel_format, raw.width, raw.height))
    }
}

/// One entry of a device's advertised format list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub name: &'static str,
    pub pixel_format: PixelFormat,
    pub bit_depth: u32,
}

impl DeviceFormat {
    pub fn new(pixel_format: PixelFormat) -> Self {
        Self {
            name: pixel_format.name(),
            pixel_format,
            bit_depth: pixel_format.bit_depth(),
        }
    }
}

/// Bounded set of output formats, fixed when the device is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedFormats {
    formats: Vec<DeviceFormat>,
}

impl SupportedFormats {
    pub fn new(pixel_formats: &[PixelFormat]) -> Result<Self> {
        let mut formats: Vec<DeviceFormat> = Vec::with_capacity(MAX_FORMATS);
        for &pf in pixel_formats {
            if formats.iter().any(|f| f.pixel_format == pf) {
                continue;
            }
            if formats.len() == MAX_FORMATS {
                return Err(VcamError::Creation(format!(
                    "at most {} output formats can be advertised",
                    MAX_FORMATS
                )));
            }
            formats.push(DeviceFormat::new(pf));
        }

        if formats.is_empty() {
            return Err(VcamError::Creation(
                "at least one output format is required".to_string(),
            ));
        }

        Ok(Self { formats })
    }

    pub fn contains(&self, pixel_format: PixelFormat) -> bool {
        self.formats.iter().any(|f| f.pixel_format == pixel_format)
    }

    pub fn get(&self, index: usize) -> Option<&DeviceFormat> {
        self.formats.get(index)
    }

    pub fn first(&self) -> PixelFormat {
        self.formats[0].pixel_format
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceFormat> {
        self.formats.iter()
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

/// Time between output frames, in seconds, as a fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(1, fps)
    }

    pub fn is_valid(&self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    pub fn fps(&self) -> f64 {
        self.denominator as f64 / self.numerator as f64
    }

    pub fn as_duration(&self) -> Duration {
        let nanos = (self.numerator as u64 * 1_000_000_000) / self.denominator.max(1) as u64;
        Duration::from_nanos(nanos)
    }
}

impl Default for FrameInterval {
    fn default() -> Self {
        Self::from_fps(30)
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.numerator, self.denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Rgb24.frame_size(64, 64), 64 * 64 * 3);
        assert_eq!(PixelFormat::Yuyv.frame_size(640, 480), 640 * 480 * 2);
        assert_eq!(PixelFormat::Nv12.frame_size(1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(PixelFormat::Uyvy.bytes_per_line(640), 1280);
    }

    #[test]
    fn test_fourcc_round_trip() {
        for pf in PixelFormat::ALL {
            let code: u32 = pf.fourcc().into();
            assert_eq!(PixelFormat::from_fourcc(FourCC::from(code)), Some(pf));
        }
        assert_eq!(PixelFormat::Yuyv.fourcc().to_string(), "YUYV");
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_raw_format_conversion() {
        let desc = FormatDescriptor::new(PixelFormat::Uyvy, 320, 240);
        let raw = RawFormat::from(desc);
        assert_eq!(raw.bit_depth, 16);
        assert_eq!(FormatDescriptor::try_from(raw).unwrap(), desc);

        let bogus = RawFormat {
            fourcc: u32::from_le_bytes(*b"XXXX"),
            ..raw
        };
        assert!(matches!(
            FormatDescriptor::try_from(bogus),
            Err(VcamError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(FormatDescriptor::new(PixelFormat::Rgb24, 63, 17).validate().is_ok());
        assert!(FormatDescriptor::new(PixelFormat::Yuyv, 63, 16).validate().is_err());
        assert!(FormatDescriptor::new(PixelFormat::Nv12, 64, 15).validate().is_err());
        assert!(FormatDescriptor::new(PixelFormat::Rgb24, 0, 16).validate().is_err());
    }

    #[test]
    fn test_oversized_descriptor_rejected() {
        let huge = FormatDescriptor::new(PixelFormat::Rgb24, u32::MAX, u32::MAX);
        assert!(matches!(huge.validate(), Err(VcamError::UnsupportedFormat(_))));
        assert_eq!(huge.frame_size(), usize::MAX);
        assert_eq!(PixelFormat::Nv12.frame_size(u32::MAX, u32::MAX), usize::MAX);

        let limit = FormatDescriptor::new(PixelFormat::Yuyv, MAX_DIMENSION, MAX_DIMENSION);
        assert!(limit.validate().is_ok());
        assert!(FormatDescriptor::new(PixelFormat::Yuyv, MAX_DIMENSION + 2, 16)
            .validate()
            .is_err());
    }

    #[test]
    fn test_supported_formats_bounds() {
        let formats = SupportedFormats::new(&[PixelFormat::Rgb24, PixelFormat::Yuyv, PixelFormat::Rgb24])
            .unwrap();
        assert_eq!(formats.len(), 2);
        assert!(formats.contains(PixelFormat::Yuyv));
        assert!(!formats.contains(PixelFormat::Nv12));
        assert_eq!(formats.get(1).unwrap().bit_depth, 16);

        assert!(SupportedFormats::new(&[]).is_err());
        assert!(SupportedFormats::new(&[
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Nv12,
        ])
        .is_err());
    }

    #[test]
    fn test_frame_interval() {
        let interval = FrameInterval::from_fps(30);
        assert_eq!(interval.as_duration(), Duration::from_nanos(33_333_333));
        assert!((interval.fps() - 30.0).abs() < f64::EPSILON);
        assert!(!FrameInterval::new(1, 0).is_valid());
        assert_eq!(FrameInterval::new(1001, 30000).to_string(), "1001/30000s");
    }
}
