//! Double-buffered ingestion slot with latest-frame-wins semantics
//!
//! Two real buffers and a dummy placeholder form a fixed arena. The `pending`
//! and `ready` roles select among them by index; the dummy carries no data
//! and is what both roles point at before the first frame arrives. The lock
//! only covers role assignment. Frame bytes are copied while the storage is
//! moved out of the arena, so neither side ever copies under the lock.
//!
//! A format generation is bumped whenever buffered frames become stale. A
//! write that started under an older generation is dropped at promotion.

use crate::error::{Result, VcamError};
use parking_lot::Mutex;
use std::ops::Deref;
use std::time::Instant;

const REAL_BUFFERS: usize = 2;

/// Selects one of the three input buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Dummy,
    Buffer(usize),
}

/// Owned storage for one input frame
#[derive(Debug, Default)]
pub struct InputBuffer {
    data: Vec<u8>,
    filled: usize,
    timestamp: Option<Instant>,
}

impl InputBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
            timestamp: None,
        }
    }

    fn write(&mut self, bytes: &[u8], capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        self.timestamp = Some(Instant::now());
    }

    /// Filled part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// When the producer finished writing this frame
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

struct SlotState {
    // `None` while the storage is checked out by the writer or the reader
    buffers: [Option<InputBuffer>; REAL_BUFFERS],
    pending: SlotRef,
    ready: SlotRef,
    capacity: usize,
    generation: u64,
    superseded: u64,
    discarded: u64,
}

impl SlotState {
    fn is_home(&self, index: usize) -> bool {
        self.buffers[index].is_some()
    }

    /// A buffer that is neither ready nor checked out
    fn free_index(&self) -> Option<usize> {
        (0..REAL_BUFFERS).find(|&i| self.is_home(i) && self.ready != SlotRef::Buffer(i))
    }

    /// Where the next frame goes: the pending buffer, any free one, or, when
    /// the reader holds the other buffer, the ready one
    fn writable_index(&self) -> Option<usize> {
        if let SlotRef::Buffer(i) = self.pending {
            if self.is_home(i) && self.ready != self.pending {
                return Some(i);
            }
        }
        self.free_index().or(match self.ready {
            SlotRef::Buffer(i) if self.is_home(i) => Some(i),
            _ => None,
        })
    }
}

/// Holds at most one unconsumed input frame
pub struct InputSlot {
    state: Mutex<SlotState>,
}

impl InputSlot {
    /// Create a slot whose buffers hold frames of up to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                buffers: [
                    Some(InputBuffer::with_capacity(capacity)),
                    Some(InputBuffer::with_capacity(capacity)),
                ],
                pending: SlotRef::Dummy,
                ready: SlotRef::Dummy,
                capacity,
                generation: 0,
                superseded: 0,
                discarded: 0,
            }),
        }
    }

    /// Copy a frame in and make it the ready frame
    ///
    /// An uncollected previous frame is discarded. Empty or over-capacity
    /// frames are rejected with `InvalidFrame` and leave the slot untouched.
    /// A frame whose format went stale while it was being copied is dropped
    /// without being promoted.
    pub fn submit(&self, data: &[u8]) -> Result<()> {
        let (index, mut buffer, capacity, generation) = {
            let mut state = self.state.lock();
            if data.is_empty() || data.len() > state.capacity {
                return Err(VcamError::InvalidFrame {
                    len: data.len(),
                    expected: state.capacity,
                });
            }

            let index = state.writable_index().ok_or(VcamError::SourceBusy)?;
            let buffer = state.buffers[index].take().ok_or(VcamError::SourceBusy)?;
            if state.ready == SlotRef::Buffer(index) {
                // The reader holds the other buffer, so the stale ready frame
                // is overwritten in place
                state.ready = SlotRef::Dummy;
                state.superseded += 1;
            }
            state.pending = SlotRef::Buffer(index);
            (index, buffer, state.capacity, state.generation)
        };

        buffer.write(data, capacity);

        let mut state = self.state.lock();
        state.buffers[index] = Some(buffer);
        if state.generation != generation || data.len() > state.capacity {
            state.discarded += 1;
            return Ok(());
        }
        if let SlotRef::Buffer(previous) = state.ready {
            if previous != index {
                state.superseded += 1;
            }
        }
        state.ready = SlotRef::Buffer(index);
        state.pending = state.free_index().map_or(SlotRef::Dummy, SlotRef::Buffer);
        Ok(())
    }

    /// Steal the ready frame, leaving the dummy in its place
    ///
    /// The returned guard owns the storage until it is released or dropped.
    pub fn take_ready(&self) -> Option<ReadyFrame<'_>> {
        let mut state = self.state.lock();
        let SlotRef::Buffer(index) = std::mem::replace(&mut state.ready, SlotRef::Dummy) else {
            return None;
        };
        let buffer = state.buffers[index].take()?;
        Some(ReadyFrame {
            slot: self,
            index,
            buffer,
        })
    }

    /// Drop the ready frame, if any, and any frame still being written
    pub fn discard_ready(&self) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;
        let discarded = state.ready != SlotRef::Dummy;
        if discarded {
            state.discarded += 1;
        }
        state.ready = SlotRef::Dummy;
        discarded
    }

    /// Change the largest accepted frame; storage grows on the next write into it
    ///
    /// Frames still being written under the old capacity are dropped.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn has_ready(&self) -> bool {
        self.state.lock().ready != SlotRef::Dummy
    }

    pub fn pending(&self) -> SlotRef {
        self.state.lock().pending
    }

    /// Frames overwritten before the submitter collected them
    pub fn superseded(&self) -> u64 {
        self.state.lock().superseded
    }

    /// Frames dropped because their format went stale
    pub fn discarded(&self) -> u64 {
        self.state.lock().discarded
    }

    /// Buffers currently held by a writer or a `ReadyFrame`
    pub fn checked_out(&self) -> usize {
        let state = self.state.lock();
        (0..REAL_BUFFERS).filter(|&i| !state.is_home(i)).count()
    }

    fn restore(&self, index: usize, buffer: InputBuffer) {
        let mut state = self.state.lock();
        state.buffers[index] = Some(buffer);
        if state.pending == SlotRef::Dummy {
            state.pending = SlotRef::Buffer(index);
        }
    }
}

/// A collected input frame on loan from the slot
pub struct ReadyFrame<'a> {
    slot: &'a InputSlot,
    index: usize,
    buffer: InputBuffer,
}

impl ReadyFrame<'_> {
    /// Hand the storage back so the producer can reuse it
    pub fn release(self) {}
}

impl Deref for ReadyFrame<'_> {
    type Target = InputBuffer;

    fn deref(&self) -> &InputBuffer {
        &self.buffer
    }
}

impl Drop for ReadyFrame<'_> {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.slot.restore(self.index, buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_take_ready_before_submit() {
        let slot = InputSlot::new(64);
        assert!(slot.take_ready().is_none());
        assert_eq!(slot.pending(), SlotRef::Dummy);
        assert!(!slot.has_ready());
    }

    #[test]
    fn test_latest_frame_wins() {
        let slot = InputSlot::new(64 * 64 * 3);
        let frame_a = vec![0xAA; 64 * 64 * 3];
        let frame_b = vec![0xBB; 64 * 64 * 3];

        slot.submit(&frame_a).unwrap();
        slot.submit(&frame_b).unwrap();

        let ready = slot.take_ready().unwrap();
        assert_eq!(ready.data(), &frame_b[..]);
        assert!(ready.timestamp().is_some());
        ready.release();

        assert!(slot.take_ready().is_none());
        assert_eq!(slot.superseded(), 1);
    }

    #[test]
    fn test_many_submits_only_last_observed() {
        let slot = InputSlot::new(16);
        for i in 0..10u8 {
            slot.submit(&[i; 16]).unwrap();
        }
        let ready = slot.take_ready().unwrap();
        assert_eq!(ready.data(), &[9u8; 16]);
        drop(ready);
        assert_eq!(slot.superseded(), 9);
        assert_eq!(slot.checked_out(), 0);
    }

    #[test]
    fn test_invalid_frames_leave_slot_unchanged() {
        let slot = InputSlot::new(8);
        slot.submit(&[1; 8]).unwrap();

        assert_eq!(
            slot.submit(&[]),
            Err(VcamError::InvalidFrame { len: 0, expected: 8 })
        );
        assert_eq!(
            slot.submit(&[2; 9]),
            Err(VcamError::InvalidFrame { len: 9, expected: 8 })
        );

        let ready = slot.take_ready().unwrap();
        assert_eq!(ready.data(), &[1; 8]);
        assert_eq!(slot.superseded(), 0);
    }

    #[test]
    fn test_short_frame_keeps_its_length() {
        let slot = InputSlot::new(32);
        slot.submit(&[7; 5]).unwrap();
        let ready = slot.take_ready().unwrap();
        assert_eq!(ready.len(), 5);
        assert_eq!(ready.capacity(), 32);
    }

    #[test]
    fn test_submit_while_frame_is_on_loan() {
        let slot = InputSlot::new(4);
        slot.submit(&[1; 4]).unwrap();
        let loaned = slot.take_ready().unwrap();

        // The producer keeps going while the reader holds a buffer
        slot.submit(&[2; 4]).unwrap();
        slot.submit(&[3; 4]).unwrap();
        assert_eq!(loaned.data(), &[1; 4]);
        assert_eq!(slot.checked_out(), 1);
        loaned.release();

        let ready = slot.take_ready().unwrap();
        assert_eq!(ready.data(), &[3; 4]);
        assert_eq!(slot.superseded(), 1);
    }

    #[test]
    fn test_pending_and_ready_never_alias() {
        let slot = InputSlot::new(4);
        for i in 0..6u8 {
            slot.submit(&[i; 4]).unwrap();
            assert_ne!(slot.pending(), SlotRef::Dummy);
            let state = slot.state.lock();
            assert_ne!(state.pending, state.ready);
        }
    }

    #[test]
    fn test_discard_and_grow_capacity() {
        let slot = InputSlot::new(4);
        slot.submit(&[1; 4]).unwrap();
        assert!(slot.discard_ready());
        assert!(!slot.discard_ready());
        assert!(slot.take_ready().is_none());

        assert_eq!(slot.discarded(), 1);

        slot.set_capacity(8);
        assert_eq!(slot.capacity(), 8);
        slot.submit(&[5; 8]).unwrap();
        assert_eq!(slot.take_ready().unwrap().data(), &[5; 8]);
    }

    #[test]
    fn test_concurrent_producer_never_tears_frames() {
        let slot = Arc::new(InputSlot::new(4096));
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let slot = Arc::clone(&slot);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..5000u32 {
                    let frame = vec![(i % 251) as u8; 4096];
                    slot.submit(&frame).unwrap();
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut observed = 0;
        while !done.load(Ordering::Acquire) || slot.has_ready() {
            if let Some(frame) = slot.take_ready() {
                let first = frame.data()[0];
                assert!(frame.data().iter().all(|&b| b == first), "torn frame");
                observed += 1;
            }
        }

        producer.join().unwrap();
        assert!(observed > 0);
        assert_eq!(slot.checked_out(), 0);
    }

    #[test]
    fn test_write_across_capacity_change_is_dropped() {
        const LARGE: usize = 1 << 20;

        for _ in 0..50 {
            let slot = Arc::new(InputSlot::new(LARGE));
            let accepted = Arc::new(AtomicU64::new(0));

            let producer = {
                let slot = Arc::clone(&slot);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    let frame = vec![0xAB; LARGE];
                    while slot.submit(&frame).is_ok() {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                })
            };

            while accepted.load(Ordering::Relaxed) < 2 {
                thread::yield_now();
            }
            slot.set_capacity(16);
            slot.discard_ready();
            producer.join().unwrap();

            // Whatever was in flight at the change must not surface
            if let Some(frame) = slot.take_ready() {
                assert!(frame.len() <= 16, "stale {} byte frame promoted", frame.len());
            }
            assert_eq!(slot.checked_out(), 0);
        }
    }
}
