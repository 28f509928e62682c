//! Virtual camera device
//!
//! A device owns the input slot, the negotiated formats, the output queue and
//! the submitter thread. Lock order is device lock before slot lock; the
//! submitter never holds the slot lock while waiting for the device lock.

use crate::config::{DeviceSpec, IdlePolicy};
use crate::error::{Result, VcamError};
use crate::input_slot::InputSlot;
use crate::negotiator::{FormatNegotiator, Negotiated};
use crate::output_queue::{OutputBuffer, OutputQueue};
use crate::stats::{DeviceStats, StatsInner};
use crate::submitter::{self, Control};
use crate::types::{FormatDescriptor, FrameInterval, SupportedFormats};
use crossbeam::channel::{self, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Submitter running, no frame source attached yet
    Created,
    /// A frame source is attached
    Active,
    /// The frame source went away; ticks keep running
    Idle,
    Stopping,
    Stopped,
}

impl DeviceState {
    pub fn is_stopping(self) -> bool {
        matches!(self, DeviceState::Stopping | DeviceState::Stopped)
    }
}

pub(crate) struct DeviceControl {
    pub(crate) negotiator: FormatNegotiator,
    pub(crate) state: DeviceState,
    pub(crate) frame_interval: FrameInterval,
    pub(crate) source_attached: bool,
}

/// State shared between the device handle, its frame source and the
/// submitter thread
pub(crate) struct Shared {
    pub(crate) index: usize,
    pub(crate) slot: InputSlot,
    pub(crate) output: OutputQueue,
    pub(crate) control: RwLock<DeviceControl>,
    pub(crate) stop: AtomicBool,
    pub(crate) stats: StatsInner,
    pub(crate) idle_policy: IdlePolicy,
    capacity_override: Option<usize>,
}

impl Shared {
    pub(crate) fn new(spec: &DeviceSpec) -> Result<Self> {
        spec.validate()?;

        let supported = SupportedFormats::new(&spec.supported_formats)?;
        let input = FormatDescriptor::new(spec.input_format, spec.width, spec.height);
        let output = FormatDescriptor::new(
            spec.output_format.unwrap_or_else(|| supported.first()),
            spec.width,
            spec.height,
        );
        let negotiator = FormatNegotiator::new(supported, input, output)
            .map_err(|err| VcamError::Creation(err.to_string()))?;

        let capacity = input_capacity(spec.input_capacity, &input);
        Ok(Self {
            index: spec.index,
            slot: InputSlot::new(capacity),
            output: OutputQueue::new(),
            control: RwLock::new(DeviceControl {
                negotiator,
                state: DeviceState::Created,
                frame_interval: spec.frame_interval,
                source_attached: false,
            }),
            stop: AtomicBool::new(false),
            stats: StatsInner::default(),
            idle_policy: spec.idle_policy,
            capacity_override: spec.input_capacity,
        })
    }

    fn submit(&self, data: &[u8]) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(VcamError::DeviceStopped);
        }
        match self.slot.submit(data) {
            Ok(()) => {
                StatsInner::bump(&self.stats.frames_submitted);
                Ok(())
            }
            Err(err) => {
                StatsInner::bump(&self.stats.frames_rejected);
                log::debug!("vcam{}: rejected input frame: {}", self.index, err);
                Err(err)
            }
        }
    }

    pub(crate) fn negotiate_format(
        &self,
        input: FormatDescriptor,
        output: FormatDescriptor,
    ) -> Result<()> {
        let mut control = self.control.write();
        if control.state.is_stopping() {
            return Err(VcamError::DeviceStopped);
        }

        let previous_input = control.negotiator.input();
        if let Err(err) = control.negotiator.negotiate(input, output) {
            log::warn!("vcam{}: negotiation failed: {}", self.index, err);
            return Err(err);
        }

        if previous_input != input {
            // Also drops a write still in flight in the old format
            self.slot.set_capacity(input_capacity(self.capacity_override, &input));
            self.slot.discard_ready();
        }
        log::info!("vcam{}: formats {} -> {}", self.index, input, output);
        Ok(())
    }

    fn set_state(&self, state: DeviceState) {
        let mut control = self.control.write();
        if control.state != state {
            log::debug!("vcam{}: {:?} -> {:?}", self.index, control.state, state);
            control.state = state;
        }
    }

    fn detach_source(&self) {
        let mut control = self.control.write();
        control.source_attached = false;
        if control.state == DeviceState::Active {
            control.state = DeviceState::Idle;
            log::info!("vcam{}: frame source detached", self.index);
        }
    }
}

fn input_capacity(capacity_override: Option<usize>, input: &FormatDescriptor) -> usize {
    let frame_size = input.frame_size();
    capacity_override.map_or(frame_size, |capacity| capacity.max(frame_size))
}

/// A virtual camera device and its submitter thread
pub struct Device {
    shared: Arc<Shared>,
    control_tx: Sender<Control>,
    thread_handle: Option<JoinHandle<()>>,
    source_name: String,
}

impl Device {
    /// Allocate the device and start its submitter
    ///
    /// Nothing is left behind on failure.
    pub fn create(spec: DeviceSpec) -> Result<Self> {
        let shared = Arc::new(Shared::new(&spec)?);
        let (control_tx, control_rx) = channel::unbounded();

        let thread_handle = submitter::spawn(
            Arc::clone(&shared),
            control_rx,
            spec.frame_interval.as_duration(),
            spec.thread_name(),
            spec.submitter_cpu,
        )
        .map_err(|err| VcamError::Creation(format!("failed to spawn submitter: {}", err)))?;

        log::info!(
            "vcam{} created: {} at {}",
            spec.index,
            spec.source_name(),
            spec.frame_interval
        );

        Ok(Self {
            shared,
            control_tx,
            thread_handle: Some(thread_handle),
            source_name: spec.source_name(),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Endpoint name frame sources attach to, `vcamfb{index}`
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn state(&self) -> DeviceState {
        self.shared.control.read().state
    }

    /// Attach the single frame source
    pub fn open_source(&self) -> Result<FrameSource> {
        let mut control = self.shared.control.write();
        if control.state.is_stopping() {
            return Err(VcamError::DeviceStopped);
        }
        if control.source_attached {
            return Err(VcamError::SourceBusy);
        }
        control.source_attached = true;
        control.state = DeviceState::Active;
        log::info!("vcam{}: frame source attached", self.shared.index);

        Ok(FrameSource {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Publish a frame in the current input format
    pub fn submit(&self, data: &[u8]) -> Result<()> {
        self.shared.submit(data)
    }

    /// Give the device an empty buffer to fill
    pub fn queue_buffer(&self, buffer: OutputBuffer) -> std::result::Result<(), OutputBuffer> {
        self.shared.output.queue_buffer(buffer)
    }

    /// Oldest delivered frame, if any
    pub fn try_dequeue(&self) -> Option<OutputBuffer> {
        self.shared.output.try_dequeue()
    }

    pub fn return_buffer(&self, buffer: OutputBuffer) -> std::result::Result<(), OutputBuffer> {
        self.shared.output.return_buffer(buffer)
    }

    /// Hand back every buffer the device holds for the capture client
    pub fn detach_client(&self) -> Vec<OutputBuffer> {
        let released = self.shared.output.release_all();
        log::info!(
            "vcam{}: capture client detached, {} buffers released",
            self.shared.index,
            released.len()
        );
        released
    }

    /// Change both formats; on failure the previous pair stays in effect
    ///
    /// A new input format resizes the input buffers and drops any frame
    /// submitted in the old one.
    pub fn negotiate_format(&self, input: FormatDescriptor, output: FormatDescriptor) -> Result<()> {
        self.shared.negotiate_format(input, output)
    }

    /// Formats currently in effect
    pub fn formats(&self) -> Negotiated {
        self.shared.control.read().negotiator.snapshot()
    }

    pub fn supported_formats(&self) -> SupportedFormats {
        self.shared.control.read().negotiator.supported().clone()
    }

    pub fn frame_interval(&self) -> FrameInterval {
        self.shared.control.read().frame_interval
    }

    /// Re-arm the submitter at a new rate
    pub fn set_frame_interval(&self, interval: FrameInterval) -> Result<()> {
        if !interval.is_valid() {
            return Err(VcamError::UnsupportedFormat(format!(
                "invalid frame interval {}",
                interval
            )));
        }

        let mut control = self.shared.control.write();
        if control.state.is_stopping() {
            return Err(VcamError::DeviceStopped);
        }
        control.frame_interval = interval;
        self.control_tx
            .send(Control::SetInterval(interval.as_duration()))
            .map_err(|_| VcamError::DeviceStopped)
    }

    /// Frames delivered so far
    pub fn frame_count(&self) -> u64 {
        self.shared.output.frame_count()
    }

    pub fn stats(&self) -> DeviceStats {
        let stats = &self.shared.stats;
        DeviceStats {
            frames_submitted: StatsInner::load(&stats.frames_submitted),
            frames_rejected: StatsInner::load(&stats.frames_rejected),
            frames_superseded: self.shared.slot.superseded(),
            frames_discarded: self.shared.slot.discarded(),
            ticks: StatsInner::load(&stats.ticks),
            frames_delivered: self.shared.output.frame_count(),
            frames_redelivered: StatsInner::load(&stats.frames_redelivered),
            no_frame_ticks: StatsInner::load(&stats.no_frame_ticks),
            conversion_failures: StatsInner::load(&stats.conversion_failures),
            backpressure_drops: StatsInner::load(&stats.backpressure_drops),
            active_buffers: self.shared.output.active_len(),
            free_buffers: self.shared.output.free_len(),
        }
    }

    /// Stop the submitter and release every buffer
    ///
    /// Blocks until an in-flight tick has finished.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        self.shared.set_state(DeviceState::Stopping);
        self.shared.stop.store(true, Ordering::Release);
        // The thread may already be gone; joining covers both cases
        let _ = self.control_tx.send(Control::Wake);
        if handle.join().is_err() {
            log::warn!("vcam{}: submitter thread panicked", self.shared.index);
        }

        self.shared.slot.discard_ready();
        let released = self.shared.output.release_all();
        self.shared.set_state(DeviceState::Stopped);
        log::info!(
            "vcam{} stopped after {} frames, {} buffers released",
            self.shared.index,
            self.shared.output.frame_count(),
            released.len()
        );
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create a device from `spec`
pub fn create_device(spec: DeviceSpec) -> Result<Device> {
    Device::create(spec)
}

/// Stop and free a device
pub fn destroy_device(device: Device) {
    device.destroy();
}

/// Exclusive producer handle; dropping it moves the device to `Idle`
pub struct FrameSource {
    shared: Arc<Shared>,
}

impl FrameSource {
    pub fn submit(&self, data: &[u8]) -> Result<()> {
        self.shared.submit(data)
    }

    /// Largest frame currently accepted
    pub fn capacity(&self) -> usize {
        self.shared.slot.capacity()
    }

    /// Format frames must currently be written in
    pub fn input_format(&self) -> FormatDescriptor {
        self.shared.control.read().negotiator.input()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shared.detach_source();
    }
}
