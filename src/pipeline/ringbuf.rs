//! Bounded drop-oldest frame buffer between the capture loop and consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::Frame;
use crate::error::{AcquisitionError, Result};

/// Thread-safe ring of the most recent frames.
///
/// `push` never blocks the producer: when the ring is full the oldest unread frame is
/// evicted. Every operation holds the lock only for the ring update itself.
pub struct FrameBuffer {
    /// Ring buffer for frame references (not the data itself)
    ring: Mutex<HeapRb<Arc<Frame>>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AcquisitionError::InvalidCapacity);
        }
        Ok(Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            stats: CachePadded::new(Stats::default()),
        })
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<Arc<Frame>>> {
        // A panicking holder can't leave the ring half-updated, so the data is still valid
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: push frame, evicting the oldest one if full
    pub fn push(&self, frame: Frame) {
        let evicted = self.ring().push_overwrite(Arc::new(frame));

        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: pop the oldest frame
    pub fn pop_oldest(&self) -> Option<Arc<Frame>> {
        let frame = self.ring().try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Discard every held frame, returning how many were removed.
    pub fn clear(&self) -> usize {
        self.ring().clear()
    }

    pub fn len(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity().get()
    }

    /// Timestamps of the held frames, oldest first
    pub fn snapshot(&self) -> Vec<f64> {
        self.ring().iter().map(|f| f.meta.timestamp).collect()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Metadata;
    use bytes::Bytes;
    use std::thread;

    fn frame(ts: f64) -> Frame {
        Frame::new(
            Bytes::new(),
            Metadata {
                frame_id: ts as u64,
                timestamp: ts,
                ..Metadata::default()
            },
        )
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            FrameBuffer::new(0),
            Err(AcquisitionError::InvalidCapacity)
        ));
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let buffer = FrameBuffer::new(3).unwrap();
        assert!(buffer.pop_oldest().is_none());
        assert_eq!(buffer.stats().read, 0);
    }

    #[test]
    fn overflow_keeps_last_n_in_arrival_order() {
        for capacity in 1..=5usize {
            for pushes in 0..=12usize {
                let buffer = FrameBuffer::new(capacity).unwrap();
                for i in 0..pushes {
                    buffer.push(frame(i as f64));
                }

                let kept = pushes.min(capacity);
                let expected: Vec<f64> = (pushes - kept..pushes).map(|i| i as f64).collect();
                assert_eq!(buffer.snapshot(), expected, "capacity {capacity}, {pushes} pushes");
                assert!(buffer.len() <= capacity);
                assert_eq!(buffer.stats().dropped, (pushes - kept) as u64);
            }
        }
    }

    #[test]
    fn drains_fifo_after_overflow() {
        let buffer = FrameBuffer::new(2).unwrap();
        for ts in [1.0, 2.0, 3.0] {
            buffer.push(frame(ts));
        }

        assert_eq!(buffer.pop_oldest().unwrap().meta.timestamp, 2.0);
        assert_eq!(buffer.pop_oldest().unwrap().meta.timestamp, 3.0);
        assert!(buffer.pop_oldest().is_none());
        assert_eq!(
            buffer.stats(),
            BufferStats {
                written: 3,
                read: 2,
                dropped: 1
            }
        );
    }

    #[test]
    fn clear_empties_the_ring() {
        let buffer = FrameBuffer::new(4).unwrap();
        buffer.push(frame(1.0));
        buffer.push(frame(2.0));
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 4);
    }

    #[test]
    fn concurrent_producer_and_consumer_never_exceed_capacity() {
        let buffer = Arc::new(FrameBuffer::new(3).unwrap());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..2_000 {
                    buffer.push(frame(i as f64));
                }
            })
        };

        let mut last = -1.0;
        let mut popped = 0u64;
        while !producer.is_finished() || !buffer.is_empty() {
            assert!(buffer.len() <= 3);
            if let Some(f) = buffer.pop_oldest() {
                assert!(f.meta.timestamp > last, "frames must come out in order");
                last = f.meta.timestamp;
                popped += 1;
            }
        }
        producer.join().unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.written, 2_000);
        assert_eq!(stats.read, popped);
        assert_eq!(stats.read + stats.dropped, 2_000);
    }
}
