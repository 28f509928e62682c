//! Output side of the device: filled buffers awaiting dequeue plus the pool
//! of empty buffers capture clients have handed over
//!
//! The active list and the frame counter share one lock. Filling happens
//! before a buffer is linked, while the submitter owns it outright.

use crate::error::{self, VcamError};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

/// Most client buffers the free pool can hold at once
pub const MAX_OUTPUT_BUFFERS: usize = 32;

/// A client-supplied buffer on its way through the device
///
/// The storage size is fixed by the client; the device never grows it.
#[derive(Debug)]
pub struct OutputBuffer {
    index: u32,
    data: Vec<u8>,
    filled: usize,
    sequence: u64,
    timestamp: Option<Instant>,
}

impl OutputBuffer {
    /// Create an empty buffer of `capacity` bytes
    pub fn new(index: u32, capacity: usize) -> Self {
        Self::from_vec(index, vec![0; capacity])
    }

    /// Wrap storage the client already owns
    pub fn from_vec(index: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            data,
            filled: 0,
            sequence: 0,
            timestamp: None,
        }
    }

    /// Client-side identifier of the buffer
    pub fn index(&self) -> u32 {
        self.index
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

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Position of this frame in the delivered stream, starting at zero
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time of the input frame this buffer was produced from
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Give the storage back to its owner
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Copy a frame in; fails without touching the buffer when it does not fit
    pub(crate) fn fill_from(
        &mut self,
        bytes: &[u8],
        timestamp: Option<Instant>,
    ) -> error::Result<()> {
        if bytes.len() > self.data.len() {
            return Err(VcamError::InvalidFrame {
                len: bytes.len(),
                expected: self.data.len(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        self.timestamp = timestamp;
        Ok(())
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.sequence = 0;
        self.timestamp = None;
    }
}

struct ActiveList {
    buffers: VecDeque<OutputBuffer>,
    frame: u64,
}

/// Ordered queue of filled buffers plus the free pool feeding it
pub struct OutputQueue {
    active: Mutex<ActiveList>,
    free: ArrayQueue<OutputBuffer>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(ActiveList {
                buffers: VecDeque::with_capacity(MAX_OUTPUT_BUFFERS),
                frame: 0,
            }),
            free: ArrayQueue::new(MAX_OUTPUT_BUFFERS),
        }
    }

    /// Hand an empty buffer to the device for a future fill
    ///
    /// Gives the buffer back when the pool is already full.
    pub fn queue_buffer(&self, mut buffer: OutputBuffer) -> Result<(), OutputBuffer> {
        buffer.reset();
        self.free.push(buffer)
    }

    /// Return a dequeued buffer for reuse
    pub fn return_buffer(&self, buffer: OutputBuffer) -> Result<(), OutputBuffer> {
        self.queue_buffer(buffer)
    }

    /// Take an empty buffer to fill, if a client supplied one
    pub fn acquire_free(&self) -> Option<OutputBuffer> {
        self.free.pop()
    }

    /// Link a filled buffer at the tail and count it as delivered
    ///
    /// Returns the sequence number assigned to the buffer.
    pub fn enqueue(&self, mut buffer: OutputBuffer) -> u64 {
        let mut active = self.active.lock();
        let sequence = active.frame;
        buffer.sequence = sequence;
        active.frame += 1;
        active.buffers.push_back(buffer);
        sequence
    }

    /// Pop the oldest filled buffer; `None` when nothing is waiting
    pub fn try_dequeue(&self) -> Option<OutputBuffer> {
        self.active.lock().buffers.pop_front()
    }

    /// Frames delivered since the device was created
    pub fn frame_count(&self) -> u64 {
        self.active.lock().frame
    }

    pub fn active_len(&self) -> usize {
        self.active.lock().buffers.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Unlink every buffer, filled or not, and hand them back to the client
    pub fn release_all(&self) -> Vec<OutputBuffer> {
        let mut released: Vec<OutputBuffer> = self.active.lock().buffers.drain(..).collect();
        while let Some(buffer) = self.free.pop() {
            released.push(buffer);
        }
        released
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_queue_has_no_frame() {
        let queue = OutputQueue::new();
        assert!(queue.try_dequeue().is_none());
        assert!(queue.acquire_free().is_none());
        assert_eq!(queue.frame_count(), 0);
    }

    #[test]
    fn test_fifo_order_and_sequence() {
        let queue = OutputQueue::new();
        for i in 0..3 {
            let mut buffer = OutputBuffer::new(i, 4);
            buffer.fill_from(&[i as u8; 4], None).unwrap();
            assert_eq!(queue.enqueue(buffer), i as u64);
        }

        assert_eq!(queue.frame_count(), 3);
        for i in 0..3 {
            let buffer = queue.try_dequeue().unwrap();
            assert_eq!(buffer.index(), i);
            assert_eq!(buffer.sequence(), i as u64);
            assert_eq!(buffer.data(), &[i as u8; 4]);
        }
        assert!(queue.try_dequeue().is_none());
        // Dequeue never rewinds the counter
        assert_eq!(queue.frame_count(), 3);
    }

    #[test]
    fn test_returned_buffer_is_reset() {
        let queue = OutputQueue::new();
        let mut buffer = OutputBuffer::new(7, 8);
        buffer.fill_from(&[1, 2, 3], Some(Instant::now())).unwrap();
        queue.enqueue(buffer);

        let buffer = queue.try_dequeue().unwrap();
        queue.return_buffer(buffer).unwrap();

        let reused = queue.acquire_free().unwrap();
        assert_eq!(reused.index(), 7);
        assert!(reused.is_empty());
        assert!(reused.timestamp().is_none());
        assert_eq!(reused.capacity(), 8);
    }

    #[test]
    fn test_fill_never_grows_client_storage() {
        let mut buffer = OutputBuffer::new(0, 2);
        assert_eq!(
            buffer.fill_from(&[9; 6], None),
            Err(VcamError::InvalidFrame { len: 6, expected: 2 })
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.into_inner().len(), 2);
    }

    #[test]
    fn test_free_pool_is_bounded() {
        let queue = OutputQueue::new();
        for i in 0..MAX_OUTPUT_BUFFERS as u32 {
            queue.queue_buffer(OutputBuffer::new(i, 1)).unwrap();
        }
        let rejected = queue.queue_buffer(OutputBuffer::new(99, 1)).unwrap_err();
        assert_eq!(rejected.index(), 99);
        assert_eq!(queue.free_len(), MAX_OUTPUT_BUFFERS);
    }

    #[test]
    fn test_release_all_drains_both_lists() {
        let queue = OutputQueue::new();
        queue.queue_buffer(OutputBuffer::new(0, 1)).unwrap();
        queue.enqueue(OutputBuffer::new(1, 1));

        let released = queue.release_all();
        assert_eq!(released.len(), 2);
        assert_eq!(queue.active_len(), 0);
        assert_eq!(queue.free_len(), 0);
    }

    #[test]
    fn test_concurrent_dequeue_sees_each_frame_once() {
        let queue = Arc::new(OutputQueue::new());
        for i in 0..1000 {
            queue.enqueue(OutputBuffer::new(i, 1));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(buffer) = queue.try_dequeue() {
                        seen.push(buffer.sequence());
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<u64>>());
    }
}
