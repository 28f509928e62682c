//! vcam FFI - C Foreign Function Interface
//!
//! C-compatible API over `vcam-pipeline` for producers and capture clients
//! written in C. Calls return 0 on success or a negative errno value.
//!
//! Output buffers cross the boundary by index: the client announces a buffer
//! with `vcam_device_queue_buffer`, a dequeue copies the delivered frame into
//! caller memory and parks the buffer until `vcam_device_return_buffer`.

use libc::{EAGAIN, EBUSY, EEXIST, EINVAL, ENOBUFS, ENODEV, ENOENT, ENOSPC};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;

use vcam_pipeline::{
    Device, DeviceSpec, FormatDescriptor, FourCC, FrameInterval, IdlePolicy, OutputBuffer,
    PixelFormat, RawFormat, VcamError, MAX_FORMATS, MAX_OUTPUT_BUFFERS,
};

/// Opaque handle to a device (C-compatible)
pub struct VcamDevice {
    _private: [u8; 0],
}

struct DeviceHandle {
    device: Device,
    buffers: Mutex<ClientBuffers>,
}

#[derive(Default)]
struct ClientBuffers {
    // Every index currently owned by the device or the client
    announced: HashSet<u32>,
    // Buffers the client has dequeued and not yet returned
    dequeued: HashMap<u32, OutputBuffer>,
}

/// C-compatible device configuration
///
/// Zero in `output_fourcc` selects the first supported format, zero in
/// `input_capacity` sizes input buffers from the input format, and a
/// negative `submitter_cpu` leaves the thread unpinned.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CDeviceConfig {
    pub index: u32,
    pub formats: [u32; MAX_FORMATS],
    pub format_count: u32,
    pub width: u32,
    pub height: u32,
    pub input_fourcc: u32,
    pub output_fourcc: u32,
    pub interval_numerator: u32,
    pub interval_denominator: u32,
    pub repeat_last: u32,
    pub input_capacity: u64,
    pub submitter_cpu: i32,
}

/// C-compatible description of a dequeued frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CFrameInfo {
    pub index: u32,
    pub bytes_used: u64,
    pub sequence: u64,
}

/// C-compatible device counters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CDeviceStats {
    pub frames_submitted: u64,
    pub frames_rejected: u64,
    pub frames_superseded: u64,
    pub frames_discarded: u64,
    pub ticks: u64,
    pub frames_delivered: u64,
    pub frames_redelivered: u64,
    pub no_frame_ticks: u64,
    pub conversion_failures: u64,
    pub backpressure_drops: u64,
    pub active_buffers: u32,
    pub free_buffers: u32,
}

fn errno(err: &VcamError) -> c_int {
    match err {
        VcamError::InvalidFrame { .. }
        | VcamError::UnsupportedFormat(_)
        | VcamError::ConversionUnsupported { .. }
        | VcamError::Creation(_) => -EINVAL,
        VcamError::OutputQueueBackpressure => -ENOBUFS,
        VcamError::SourceBusy => -EBUSY,
        VcamError::DeviceStopped => -ENODEV,
    }
}

fn pixel_format(fourcc: u32) -> Result<PixelFormat, c_int> {
    PixelFormat::from_fourcc(FourCC::from(fourcc)).ok_or(-EINVAL)
}

impl CDeviceConfig {
    fn to_spec(&self) -> Result<DeviceSpec, c_int> {
        let count = self.format_count as usize;
        if count == 0 || count > MAX_FORMATS {
            return Err(-EINVAL);
        }
        let supported_formats = self.formats[..count]
            .iter()
            .map(|&fourcc| pixel_format(fourcc))
            .collect::<Result<Vec<_>, _>>()?;
        let output_format = match self.output_fourcc {
            0 => None,
            fourcc => Some(pixel_format(fourcc)?),
        };

        Ok(DeviceSpec {
            index: self.index as usize,
            supported_formats,
            width: self.width,
            height: self.height,
            input_format: pixel_format(self.input_fourcc)?,
            output_format,
            frame_interval: FrameInterval::new(self.interval_numerator, self.interval_denominator),
            idle_policy: if self.repeat_last != 0 {
                IdlePolicy::RepeatLast
            } else {
                IdlePolicy::Skip
            },
            input_capacity: (self.input_capacity != 0).then_some(self.input_capacity as usize),
            submitter_cpu: usize::try_from(self.submitter_cpu).ok(),
        })
    }
}

unsafe fn handle<'a>(ptr: *mut VcamDevice) -> Option<&'a DeviceHandle> {
    (ptr as *const DeviceHandle).as_ref()
}

// ============================================================================
// DEVICE LIFECYCLE
// ============================================================================

/// Create a device and start its submitter thread
///
/// # Safety
/// `config` must point to a valid `CDeviceConfig` and `out` to writable memory.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_create(
    config: *const CDeviceConfig,
    out: *mut *mut VcamDevice,
) -> c_int {
    if config.is_null() || out.is_null() {
        return -EINVAL;
    }
    *out = ptr::null_mut();

    let spec = match (*config).to_spec() {
        Ok(spec) => spec,
        Err(code) => return code,
    };
    match Device::create(spec) {
        Ok(device) => {
            let handle = Box::new(DeviceHandle {
                device,
                buffers: Mutex::new(ClientBuffers::default()),
            });
            *out = Box::into_raw(handle) as *mut VcamDevice;
            0
        }
        Err(err) => {
            log::warn!("vcam_device_create: {}", err);
            errno(&err)
        }
    }
}

/// Stop the device and free it, including every buffer it still holds
///
/// # Safety
/// Caller must ensure ptr is valid and not already freed.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_destroy(ptr: *mut VcamDevice) {
    if !ptr.is_null() {
        let handle = *Box::from_raw(ptr as *mut DeviceHandle);
        handle.device.destroy();
    }
}

// ============================================================================
// PRODUCER API
// ============================================================================

/// Publish one frame in the current input format
///
/// # Safety
/// `ptr` must be a live device and `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_submit(
    ptr: *mut VcamDevice,
    data: *const u8,
    len: usize,
) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    if data.is_null() {
        return -EINVAL;
    }

    match handle.device.submit(slice::from_raw_parts(data, len)) {
        Ok(()) => 0,
        Err(err) => errno(&err),
    }
}

// ============================================================================
// CAPTURE CLIENT API
// ============================================================================

/// Announce an empty buffer of `size` bytes under `index`
///
/// Returns `-EEXIST` when `index` is already announced and `-ENOBUFS` once
/// `MAX_OUTPUT_BUFFERS` buffers are.
///
/// # Safety
/// `ptr` must be a live device.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_queue_buffer(
    ptr: *mut VcamDevice,
    index: u32,
    size: usize,
) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    let mut buffers = handle.buffers.lock();
    if buffers.announced.len() >= MAX_OUTPUT_BUFFERS {
        return -ENOBUFS;
    }
    if !buffers.announced.insert(index) {
        return -EEXIST;
    }

    match handle.device.queue_buffer(OutputBuffer::new(index, size)) {
        Ok(()) => 0,
        Err(_) => {
            buffers.announced.remove(&index);
            -ENOBUFS
        }
    }
}

/// Copy the oldest delivered frame into `dst`
///
/// Returns `-EAGAIN` when nothing is waiting. When `dst_len` is too small
/// the frame is still dequeued, `info` is filled and `-ENOSPC` is returned.
///
/// # Safety
/// `ptr` must be a live device, `dst` must point to `dst_len` writable bytes
/// and `info` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_dequeue(
    ptr: *mut VcamDevice,
    dst: *mut u8,
    dst_len: usize,
    info: *mut CFrameInfo,
) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    if dst.is_null() {
        return -EINVAL;
    }
    let Some(buffer) = handle.device.try_dequeue() else {
        return -EAGAIN;
    };

    if !info.is_null() {
        *info = CFrameInfo {
            index: buffer.index(),
            bytes_used: buffer.len() as u64,
            sequence: buffer.sequence(),
        };
    }
    let fits = buffer.len() <= dst_len;
    if fits {
        ptr::copy_nonoverlapping(buffer.data().as_ptr(), dst, buffer.len());
    }
    if let Some(stale) = handle.buffers.lock().dequeued.insert(buffer.index(), buffer) {
        log::warn!("vcam_device_dequeue: buffer {} dequeued twice", stale.index());
    }

    if fits {
        0
    } else {
        -ENOSPC
    }
}

/// Give a dequeued buffer back to the device
///
/// # Safety
/// `ptr` must be a live device.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_return_buffer(ptr: *mut VcamDevice, index: u32) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    let mut buffers = handle.buffers.lock();
    let Some(buffer) = buffers.dequeued.remove(&index) else {
        return -ENOENT;
    };

    match handle.device.return_buffer(buffer) {
        Ok(()) => 0,
        Err(_) => {
            buffers.announced.remove(&index);
            -ENOBUFS
        }
    }
}

// ============================================================================
// FORMAT & TIMING
// ============================================================================

/// Negotiate new input and output formats
///
/// # Safety
/// `ptr` must be a live device; `input` and `output` must be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_negotiate(
    ptr: *mut VcamDevice,
    input: *const RawFormat,
    output: *const RawFormat,
) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    if input.is_null() || output.is_null() {
        return -EINVAL;
    }

    let result = FormatDescriptor::try_from(*input).and_then(|input| {
        let output = FormatDescriptor::try_from(*output)?;
        handle.device.negotiate_format(input, output)
    });
    match result {
        Ok(()) => 0,
        Err(err) => errno(&err),
    }
}

/// Change the output frame interval (seconds per frame as a fraction)
///
/// # Safety
/// `ptr` must be a live device.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_set_frame_interval(
    ptr: *mut VcamDevice,
    numerator: u32,
    denominator: u32,
) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    match handle
        .device
        .set_frame_interval(FrameInterval::new(numerator, denominator))
    {
        Ok(()) => 0,
        Err(err) => errno(&err),
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Frames delivered so far; 0 for a null handle
///
/// # Safety
/// `ptr` must be null or a live device.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_frame_count(ptr: *mut VcamDevice) -> u64 {
    handle(ptr).map_or(0, |handle| handle.device.frame_count())
}

/// Fill `out` with the device counters
///
/// # Safety
/// `ptr` must be a live device and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn vcam_device_stats(ptr: *mut VcamDevice, out: *mut CDeviceStats) -> c_int {
    let Some(handle) = handle(ptr) else {
        return -EINVAL;
    };
    if out.is_null() {
        return -EINVAL;
    }

    let stats = handle.device.stats();
    *out = CDeviceStats {
        frames_submitted: stats.frames_submitted,
        frames_rejected: stats.frames_rejected,
        frames_superseded: stats.frames_superseded,
        frames_discarded: stats.frames_discarded,
        ticks: stats.ticks,
        frames_delivered: stats.frames_delivered,
        frames_redelivered: stats.frames_redelivered,
        no_frame_ticks: stats.no_frame_ticks,
        conversion_failures: stats.conversion_failures,
        backpressure_drops: stats.backpressure_drops,
        active_buffers: stats.active_buffers as u32,
        free_buffers: stats.free_buffers as u32,
    };
    0
}

/// Get library version string
#[no_mangle]
pub extern "C" fn vcam_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> CDeviceConfig {
        CDeviceConfig {
            index: 3,
            formats: [PixelFormat::Rgb24.fourcc().into(), 0, 0, 0],
            format_count: 1,
            width: 32,
            height: 32,
            input_fourcc: PixelFormat::Rgb24.fourcc().into(),
            output_fourcc: 0,
            interval_numerator: 1,
            interval_denominator: 500,
            repeat_last: 0,
            input_capacity: 0,
            submitter_cpu: -1,
        }
    }

    unsafe fn create(config: &CDeviceConfig) -> *mut VcamDevice {
        let mut device = ptr::null_mut();
        assert_eq!(vcam_device_create(config, &mut device), 0);
        assert!(!device.is_null());
        device
    }

    #[test]
    fn test_device_ffi_round_trip() {
        unsafe {
            let device = create(&config());
            assert_eq!(vcam_device_queue_buffer(device, 5, 32 * 32 * 3), 0);

            let frame = vec![0x5A; 32 * 32 * 3];
            assert_eq!(vcam_device_submit(device, frame.as_ptr(), frame.len()), 0);

            let mut dst = vec![0u8; frame.len()];
            let mut info = CFrameInfo::default();
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut result = -EAGAIN;
            while result == -EAGAIN && Instant::now() < deadline {
                result = vcam_device_dequeue(device, dst.as_mut_ptr(), dst.len(), &mut info);
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(result, 0);
            assert_eq!(dst, frame);
            assert_eq!(info.index, 5);
            assert_eq!(info.bytes_used, frame.len() as u64);
            assert_eq!(vcam_device_frame_count(device), 1);

            // Parked until returned
            assert_eq!(vcam_device_queue_buffer(device, 5, 16), -EEXIST);
            assert_eq!(vcam_device_return_buffer(device, 5), 0);
            assert_eq!(vcam_device_return_buffer(device, 5), -ENOENT);

            let mut stats = CDeviceStats::default();
            assert_eq!(vcam_device_stats(device, &mut stats), 0);
            assert_eq!(stats.frames_delivered, 1);
            assert_eq!(stats.free_buffers, 1);

            vcam_device_destroy(device);
        }
    }

    #[test]
    fn test_error_codes() {
        unsafe {
            let mut device = ptr::null_mut();
            let mut bad = config();
            bad.format_count = 0;
            assert_eq!(vcam_device_create(&bad, &mut device), -EINVAL);
            assert!(device.is_null());

            let device = create(&config());
            let mut dst = [0u8; 4];
            assert_eq!(
                vcam_device_dequeue(device, dst.as_mut_ptr(), dst.len(), ptr::null_mut()),
                -EAGAIN
            );
            assert_eq!(vcam_device_submit(device, dst.as_ptr(), 0), -EINVAL);
            assert_eq!(vcam_device_set_frame_interval(device, 1, 0), -EINVAL);
            assert_eq!(vcam_device_set_frame_interval(device, 1, 60), 0);

            let input = RawFormat::from(FormatDescriptor::new(PixelFormat::Rgb24, 32, 32));
            let output = RawFormat::from(FormatDescriptor::new(PixelFormat::Nv12, 32, 32));
            assert_eq!(vcam_device_negotiate(device, &input, &output), -EINVAL);
            assert_eq!(vcam_device_negotiate(device, &input, &input), 0);

            vcam_device_destroy(device);
            vcam_device_destroy(ptr::null_mut());
            assert_eq!(vcam_device_frame_count(ptr::null_mut()), 0);
        }
    }

    #[test]
    fn test_buffer_indices_are_unique() {
        unsafe {
            let device = create(&config());
            assert_eq!(vcam_device_queue_buffer(device, 7, 64), 0);
            // Still sitting in the free pool
            assert_eq!(vcam_device_queue_buffer(device, 7, 64), -EEXIST);
            assert_eq!(vcam_device_return_buffer(device, 7), -ENOENT);

            let mut queued = 1;
            for index in 100..200 {
                match vcam_device_queue_buffer(device, index, 64) {
                    0 => queued += 1,
                    code => {
                        assert_eq!(code, -ENOBUFS);
                        break;
                    }
                }
            }
            assert_eq!(queued, MAX_OUTPUT_BUFFERS);

            let mut stats = CDeviceStats::default();
            assert_eq!(vcam_device_stats(device, &mut stats), 0);
            assert_eq!(stats.free_buffers as usize, MAX_OUTPUT_BUFFERS);

            vcam_device_destroy(device);
        }
    }

    #[test]
    fn test_version() {
        unsafe {
            let version = vcam_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert_eq!(version_str, "0.1.0");
        }
    }
}
