//! Submitter task: one thread per device moving frames from the input slot
//! to the output queue at the configured frame interval
//!
//! Paced by a `crossbeam` ticker. The control channel wakes the thread early
//! for shutdown or to re-arm the ticker after an interval change.

use crate::config::IdlePolicy;
use crate::device::Shared;
use crate::error::VcamError;
use crate::format_conversion::FrameConverter;
use crate::negotiator::Negotiated;
use crate::stats::StatsInner;
use crossbeam::channel::{self, select, Receiver};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Messages from the device handle to its submitter thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Re-check the stop flag now
    Wake,
    SetInterval(Duration),
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A fresh frame was queued with this sequence number
    Delivered { sequence: u64 },
    /// The previous frame was queued again (`IdlePolicy::RepeatLast`)
    Redelivered { sequence: u64 },
    NoFrameAvailable,
    /// The frame could not be converted and was dropped
    ConversionFailed(VcamError),
    /// No client buffer was free, or the free one was too small; the frame
    /// was dropped
    OutputQueueBackpressure,
    Stopped,
}

enum Step {
    Continue,
    Retime(Duration),
    Exit,
}

pub(crate) struct Submitter {
    shared: Arc<Shared>,
    converter: FrameConverter,
    converted: Vec<u8>,
    // Only kept under `IdlePolicy::RepeatLast`
    last_frame: Vec<u8>,
    last_timestamp: Option<Instant>,
    last_generation: u64,
}

impl Submitter {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            converter: FrameConverter::new(),
            converted: Vec::new(),
            last_frame: Vec::new(),
            last_timestamp: None,
            last_generation: 0,
        }
    }

    /// Run one transfer from the slot to the output queue
    pub(crate) fn tick(&mut self) -> TickOutcome {
        let shared = Arc::clone(&self.shared);
        if shared.stop.load(Ordering::Acquire) {
            return TickOutcome::Stopped;
        }
        StatsInner::bump(&shared.stats.ticks);

        // Negotiation discards the ready frame under the write lock, so a
        // frame taken here always matches the snapshot
        let (negotiated, frame) = {
            let control = shared.control.read();
            (control.negotiator.snapshot(), shared.slot.take_ready())
        };
        let Some(frame) = frame else {
            return self.idle(&shared, &negotiated);
        };
        let timestamp = frame.timestamp();

        if negotiated.flags.any() {
            if let Err(err) = self.converter.convert(
                frame.data(),
                &negotiated.input,
                &negotiated.output,
                negotiated.flags,
                &mut self.converted,
            ) {
                StatsInner::bump(&shared.stats.conversion_failures);
                log::debug!("vcam{}: dropping frame: {}", shared.index, err);
                return TickOutcome::ConversionFailed(err);
            }
        }

        let bytes: &[u8] = if negotiated.flags.any() {
            &self.converted
        } else {
            frame.data()
        };
        let Some(sequence) = deliver(&shared, bytes, timestamp) else {
            return TickOutcome::OutputQueueBackpressure;
        };
        if shared.idle_policy == IdlePolicy::RepeatLast {
            self.last_frame.clear();
            self.last_frame.extend_from_slice(bytes);
            self.last_timestamp = timestamp;
            self.last_generation = negotiated.generation;
        }

        frame.release();
        TickOutcome::Delivered { sequence }
    }

    fn idle(&mut self, shared: &Shared, negotiated: &Negotiated) -> TickOutcome {
        if self.last_generation != negotiated.generation {
            // Stale encoding after renegotiation
            self.last_frame.clear();
        }

        if shared.idle_policy == IdlePolicy::RepeatLast && !self.last_frame.is_empty() {
            let Some(sequence) = deliver(shared, &self.last_frame, self.last_timestamp) else {
                return TickOutcome::OutputQueueBackpressure;
            };
            StatsInner::bump(&shared.stats.frames_redelivered);
            return TickOutcome::Redelivered { sequence };
        }

        StatsInner::bump(&shared.stats.no_frame_ticks);
        log::trace!("vcam{}: no frame this tick", shared.index);
        TickOutcome::NoFrameAvailable
    }

    fn run(mut self, control: Receiver<Control>, interval: Duration) {
        let index = self.shared.index;
        log::info!("vcam{} submitter started ({:?} per frame)", index, interval);

        let mut ticker = channel::tick(interval);
        loop {
            let step = select! {
                recv(ticker) -> _ => match self.tick() {
                    TickOutcome::Stopped => Step::Exit,
                    _ => Step::Continue,
                },
                recv(control) -> msg => match msg {
                    Ok(Control::SetInterval(interval)) => Step::Retime(interval),
                    Ok(Control::Wake) if !self.shared.stop.load(Ordering::Acquire) => {
                        Step::Continue
                    }
                    Ok(Control::Wake) | Err(_) => Step::Exit,
                },
            };

            match step {
                Step::Continue => {}
                Step::Retime(interval) => {
                    log::debug!("vcam{}: frame interval now {:?}", index, interval);
                    ticker = channel::tick(interval);
                }
                Step::Exit => break,
            }
        }

        log::info!("vcam{} submitter exiting", index);
    }
}

/// Fill a free client buffer and queue it; `None` when the frame was dropped
fn deliver(shared: &Shared, bytes: &[u8], timestamp: Option<Instant>) -> Option<u64> {
    let Some(mut buffer) = shared.output.acquire_free() else {
        StatsInner::bump(&shared.stats.backpressure_drops);
        log::debug!("vcam{}: no free output buffer, dropping frame", shared.index);
        return None;
    };

    if let Err(err) = buffer.fill_from(bytes, timestamp) {
        StatsInner::bump(&shared.stats.backpressure_drops);
        log::debug!(
            "vcam{}: output buffer {} too small, dropping frame: {}",
            shared.index,
            buffer.index(),
            err
        );
        if let Err(buffer) = shared.output.return_buffer(buffer) {
            log::warn!("vcam{}: free pool full, lost buffer {}", shared.index, buffer.index());
        }
        return None;
    }
    Some(shared.output.enqueue(buffer))
}

/// Start the submitter thread for a device
pub(crate) fn spawn(
    shared: Arc<Shared>,
    control: Receiver<Control>,
    interval: Duration,
    name: String,
    cpu: Option<usize>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.clone()).spawn(move || {
        if let Some(cpu) = cpu {
            pin_to_cpu(&name, cpu);
        }
        Submitter::new(shared).run(control, interval);
    })
}

fn pin_to_cpu(name: &str, cpu: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|core| core.id == cpu))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);

    if pinned {
        log::debug!("{} pinned to cpu {}", name, cpu);
    } else {
        log::warn!("{}: could not pin to cpu {}", name, cpu);
    }
}
