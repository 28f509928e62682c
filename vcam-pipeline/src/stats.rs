//! Per-device counters (atomic for lock-free reads)

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct StatsInner {
    pub(crate) frames_submitted: AtomicU64,
    pub(crate) frames_rejected: AtomicU64,
    pub(crate) ticks: AtomicU64,
    pub(crate) frames_redelivered: AtomicU64,
    pub(crate) no_frame_ticks: AtomicU64,
    pub(crate) conversion_failures: AtomicU64,
    pub(crate) backpressure_drops: AtomicU64,
}

impl StatsInner {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of a device's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames accepted into the input slot
    pub frames_submitted: u64,
    /// Submits refused at the boundary
    pub frames_rejected: u64,
    /// Frames replaced by a newer one before the submitter collected them
    pub frames_superseded: u64,
    /// Frames dropped because the input format changed under them
    pub frames_discarded: u64,
    pub ticks: u64,
    /// Equal to the output frame counter
    pub frames_delivered: u64,
    pub frames_redelivered: u64,
    pub no_frame_ticks: u64,
    pub conversion_failures: u64,
    pub backpressure_drops: u64,
    pub active_buffers: usize,
    pub free_buffers: usize,
}
