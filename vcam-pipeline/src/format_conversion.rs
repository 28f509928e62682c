//! Pixel-format remapping and nearest-neighbour resolution scaling
//!
//! When both stages are needed the frame is resampled first, in its source
//! encoding, and only the surviving pixels are recoded. Packed 4:2:2 frames
//! are resampled in whole macropixels so chroma pairs stay intact.

use crate::error::{Result, VcamError};
use crate::negotiator::ConversionFlags;
use crate::types::{FormatDescriptor, PixelFormat};
use rayon::prelude::*;

/// Byte offsets of (R, G, B) inside a packed 24-bit pixel
fn rgb_offsets(format: PixelFormat) -> (usize, usize, usize) {
    match format {
        PixelFormat::Bgr24 => (2, 1, 0),
        _ => (0, 1, 2),
    }
}

/// Byte offsets of (Y0, U, Y1, V) inside a packed 4:2:2 macropixel
fn yuv_offsets(format: PixelFormat) -> (usize, usize, usize, usize) {
    match format {
        PixelFormat::Uyvy => (1, 0, 3, 2),
        _ => (0, 1, 2, 3),
    }
}

/// Smallest horizontally resamplable unit as (bytes, pixels)
fn scale_unit(format: PixelFormat) -> Option<(usize, usize)> {
    match format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some((3, 1)),
        PixelFormat::Yuyv | PixelFormat::Uyvy => Some((4, 2)),
        PixelFormat::Nv12 | PixelFormat::Mjpeg => None,
    }
}

fn can_recode(from: PixelFormat, to: PixelFormat) -> bool {
    use PixelFormat::*;
    matches!(
        (from, to),
        (Rgb24 | Bgr24 | Yuyv | Uyvy, Rgb24 | Bgr24 | Yuyv | Uyvy | Nv12)
    )
}

/// Whether a frame can be taken from `from` to `to` given the negotiated flags
pub fn is_supported(from: PixelFormat, to: PixelFormat, flags: ConversionFlags) -> bool {
    (!flags.resolution || scale_unit(from).is_some()) && (!flags.pixel || can_recode(from, to))
}

/// Reusable converter; keeps its intermediate buffers between frames
#[derive(Debug, Default)]
pub struct FrameConverter {
    scaled: Vec<u8>,
    stage: Vec<u8>,
}

impl FrameConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `src`, laid out as `from`, into `dst`, laid out as `to`
    ///
    /// Returns the number of bytes written to `dst`.
    pub fn convert(
        &mut self,
        src: &[u8],
        from: &FormatDescriptor,
        to: &FormatDescriptor,
        flags: ConversionFlags,
        dst: &mut Vec<u8>,
    ) -> Result<usize> {
        if !flags.any() {
            dst.clear();
            dst.extend_from_slice(src);
            return Ok(dst.len());
        }

        if !is_supported(from.pixel_format, to.pixel_format, flags) {
            return Err(VcamError::ConversionUnsupported {
                from: from.pixel_format,
                to: to.pixel_format,
            });
        }
        from.validate()?;
        to.validate()?;

        let frame_size = from.frame_size();
        if src.len() < frame_size {
            return Err(VcamError::InvalidFrame {
                len: src.len(),
                expected: frame_size,
            });
        }
        let src = &src[..frame_size];

        let Self { scaled, stage } = self;
        if !flags.resolution {
            recode(src, from, to.pixel_format, dst, stage)?;
            return check_output(dst, to);
        }

        // Resampling happens in the source encoding, so the target geometry
        // has to be representable there too
        let resized = FormatDescriptor::new(from.pixel_format, to.width, to.height);
        if resized.validate().is_err() {
            return Err(VcamError::ConversionUnsupported {
                from: from.pixel_format,
                to: to.pixel_format,
            });
        }
        if !flags.pixel {
            scale_nearest(src, from, &resized, dst);
            return check_output(dst, to);
        }

        scale_nearest(src, from, &resized, scaled);
        recode(&scaled[..], &resized, to.pixel_format, dst, stage)?;
        check_output(dst, to)
    }
}

fn check_output(dst: &[u8], to: &FormatDescriptor) -> Result<usize> {
    if dst.len() != to.frame_size() {
        return Err(VcamError::InvalidFrame {
            len: dst.len(),
            expected: to.frame_size(),
        });
    }
    Ok(dst.len())
}

/// Convert a single frame without keeping any scratch state around
pub fn convert_frame(src: &[u8], from: &FormatDescriptor, to: &FormatDescriptor) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(to.frame_size());
    FrameConverter::new().convert(src, from, to, ConversionFlags::between(from, to), &mut dst)?;
    Ok(dst)
}

/// Nearest-neighbour resampling without touching the pixel encoding
fn scale_nearest(src: &[u8], from: &FormatDescriptor, to: &FormatDescriptor, dst: &mut Vec<u8>) {
    let Some((unit_bytes, unit_pixels)) = scale_unit(from.pixel_format) else {
        return;
    };
    let src_units = from.width as usize / unit_pixels;
    let dst_units = to.width as usize / unit_pixels;
    let src_stride = src_units * unit_bytes;
    let dst_stride = dst_units * unit_bytes;
    let src_height = from.height as usize;
    let dst_height = to.height as usize;

    dst.clear();
    dst.resize(dst_stride * dst_height, 0);

    dst.par_chunks_mut(dst_stride)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = y * src_height / dst_height;
            let src_row = &src[sy * src_stride..(sy + 1) * src_stride];
            for (x, unit) in row.chunks_exact_mut(unit_bytes).enumerate() {
                let sx = x * src_units / dst_units;
                unit.copy_from_slice(&src_row[sx * unit_bytes..(sx + 1) * unit_bytes]);
            }
        });
}

/// Per-pixel recoding at a fixed resolution
fn recode(
    src: &[u8],
    desc: &FormatDescriptor,
    to: PixelFormat,
    dst: &mut Vec<u8>,
    stage: &mut Vec<u8>,
) -> Result<()> {
    use PixelFormat::*;
    let from = desc.pixel_format;

    match (from, to) {
        (Rgb24 | Bgr24, Rgb24 | Bgr24) => rgb_to_rgb(src, from, to, dst),
        (Rgb24 | Bgr24, Yuyv | Uyvy) => rgb_to_yuv422(src, from, to, dst),
        (Yuyv | Uyvy, Rgb24 | Bgr24) => yuv422_to_rgb(src, from, to, dst),
        (Yuyv | Uyvy, Yuyv | Uyvy) => yuv422_to_yuv422(src, from, to, dst),
        (Yuyv | Uyvy, Nv12) => yuv422_to_nv12(src, from, desc.width, desc.height, dst),
        (Rgb24 | Bgr24, Nv12) => {
            rgb_to_yuv422(src, from, Yuyv, stage);
            yuv422_to_nv12(&stage[..], Yuyv, desc.width, desc.height, dst);
        }
        _ => return Err(VcamError::ConversionUnsupported { from, to }),
    }
    Ok(())
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 studio-swing RGB to YCbCr
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (i32, i32, i32) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y, u, v)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    (
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    )
}

fn rgb_to_rgb(src: &[u8], from: PixelFormat, to: PixelFormat, dst: &mut Vec<u8>) {
    let (sr, sg, sb) = rgb_offsets(from);
    let (dr, dg, db) = rgb_offsets(to);
    dst.clear();
    dst.resize(src.len(), 0);

    let src_px: &[[u8; 3]] = bytemuck::cast_slice(src);
    let dst_px: &mut [[u8; 3]] = bytemuck::cast_slice_mut(&mut dst[..]);
    for (s, d) in src_px.iter().zip(dst_px.iter_mut()) {
        d[dr] = s[sr];
        d[dg] = s[sg];
        d[db] = s[sb];
    }
}

fn rgb_to_yuv422(src: &[u8], from: PixelFormat, to: PixelFormat, dst: &mut Vec<u8>) {
    let (r, g, b) = rgb_offsets(from);
    let (y0, u, y1, v) = yuv_offsets(to);
    dst.clear();
    dst.resize(src.len() / 3 * 2, 0);

    // Two RGB pixels per macropixel, chroma averaged across the pair
    for (pair, out) in src.chunks_exact(6).zip(dst.chunks_exact_mut(4)) {
        let (ya, ua, va) = rgb_to_ycbcr(pair[r], pair[g], pair[b]);
        let (yb, ub, vb) = rgb_to_ycbcr(pair[3 + r], pair[3 + g], pair[3 + b]);
        out[y0] = clamp_u8(ya);
        out[y1] = clamp_u8(yb);
        out[u] = clamp_u8((ua + ub) / 2);
        out[v] = clamp_u8((va + vb) / 2);
    }
}

fn yuv422_to_rgb(src: &[u8], from: PixelFormat, to: PixelFormat, dst: &mut Vec<u8>) {
    let (y0, u, y1, v) = yuv_offsets(from);
    let (r, g, b) = rgb_offsets(to);
    dst.clear();
    dst.resize(src.len() / 2 * 3, 0);

    let macropixels: &[[u8; 4]] = bytemuck::cast_slice(src);
    for (mp, out) in macropixels.iter().zip(dst.chunks_exact_mut(6)) {
        for (i, luma) in [mp[y0], mp[y1]].into_iter().enumerate() {
            let (pr, pg, pb) = ycbcr_to_rgb(luma, mp[u], mp[v]);
            out[3 * i + r] = pr;
            out[3 * i + g] = pg;
            out[3 * i + b] = pb;
        }
    }
}

fn yuv422_to_yuv422(src: &[u8], from: PixelFormat, to: PixelFormat, dst: &mut Vec<u8>) {
    let (sy0, su, sy1, sv) = yuv_offsets(from);
    let (dy0, du, dy1, dv) = yuv_offsets(to);
    dst.clear();
    dst.resize(src.len(), 0);

    let src_mp: &[[u8; 4]] = bytemuck::cast_slice(src);
    let dst_mp: &mut [[u8; 4]] = bytemuck::cast_slice_mut(&mut dst[..]);
    for (s, d) in src_mp.iter().zip(dst_mp.iter_mut()) {
        d[dy0] = s[sy0];
        d[du] = s[su];
        d[dy1] = s[sy1];
        d[dv] = s[sv];
    }
}

/// Packed 4:2:2 to NV12, averaging chroma of each vertical row pair
fn yuv422_to_nv12(src: &[u8], from: PixelFormat, width: u32, height: u32, dst: &mut Vec<u8>) {
    let (oy0, ou, oy1, ov) = yuv_offsets(from);
    let width = width as usize;
    let height = height as usize;
    let in_linesize = width * 2;
    let y_size = width * height;

    dst.clear();
    dst.resize(y_size + width * (height / 2), 0);
    let (output_y, output_uv) = dst.split_at_mut(y_size);

    for y in (0..height).step_by(2) {
        let y0_offset = y * in_linesize;
        let y1_offset = (y + 1) * in_linesize;
        let out_y0_offset = y * width;
        let out_y1_offset = (y + 1) * width;
        let out_uv_offset = (y / 2) * width;

        for x in (0..width).step_by(2) {
            let in0 = y0_offset + x * 2;
            let in1 = y1_offset + x * 2;

            output_y[out_y0_offset + x] = src[in0 + oy0];
            output_y[out_y0_offset + x + 1] = src[in0 + oy1];
            output_y[out_y1_offset + x] = src[in1 + oy0];
            output_y[out_y1_offset + x + 1] = src[in1 + oy1];

            let u_avg = ((src[in0 + ou] as u16 + src[in1 + ou] as u16) / 2) as u8;
            let v_avg = ((src[in0 + ov] as u16 + src[in1 + ov] as u16) / 2) as u8;

            output_uv[out_uv_offset + x] = u_avg;
            output_uv[out_uv_offset + x + 1] = v_avg;
        }
    }
}
