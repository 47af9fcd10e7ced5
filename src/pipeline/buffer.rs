//! Latest-frame buffer shared by the acquisition thread and consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::utils::CachePadded;

use crate::capture::{Frame, StreamKind};

/// Holds at most one frame per stream; one writer, any number of readers.
///
/// Each slot lock only covers swapping or cloning an `Arc<Frame>`. Readers
/// get a deep copy made after the lock is released.
#[derive(Default)]
pub struct FrameBuffer {
    color: Slot,
    depth: Slot,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Slot {
    frame: Mutex<Option<Arc<Frame>>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<Frame>>> {
        // A poisoned slot still holds a whole Arc; nothing can be half-written.
        self.frame.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    rejected: AtomicU64,
    snapshots: AtomicU64,
}

/// Counters since the buffer was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub published: u64,
    /// Publishes dropped because they were not newer than the stored frame
    pub rejected: u64,
    pub snapshots: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, stream: StreamKind) -> &Slot {
        match stream {
            StreamKind::Color => &self.color,
            StreamKind::Depth => &self.depth,
        }
    }

    /// Replace the stored frame for the frame's stream.
    ///
    /// Frames whose sequence does not advance past the stored one are
    /// dropped so readers never go back in time. Returns whether the frame
    /// was stored.
    pub fn publish(&self, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        let mut slot = self.slot(frame.stream()).lock();
        if slot
            .as_ref()
            .is_some_and(|current| current.sequence() >= frame.sequence())
        {
            drop(slot);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // The previous frame is released after the lock is dropped.
        let previous = slot.replace(frame);
        drop(slot);
        drop(previous);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Independent copy of the latest frame, or `None` if nothing was
    /// published since the buffer was created or last cleared.
    pub fn snapshot(&self, stream: StreamKind) -> Option<Frame> {
        let shared = self.slot(stream).lock().clone()?;
        self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
        Some(shared.deep_copy())
    }

    /// Borrow the latest frame without copying it.
    pub fn peek<R>(&self, stream: StreamKind, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let shared = self.slot(stream).lock().clone()?;
        Some(f(&shared))
    }

    pub fn latest_sequence(&self, stream: StreamKind) -> Option<u64> {
        self.slot(stream).lock().as_ref().map(|f| f.sequence())
    }

    pub fn has_frame(&self, stream: StreamKind) -> bool {
        self.slot(stream).lock().is_some()
    }

    /// Drop both stored frames.
    pub fn clear(&self) {
        for stream in StreamKind::ALL {
            let previous = self.slot(stream).lock().take();
            drop(previous);
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            published: self.stats.published.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            snapshots: self.stats.snapshots.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;
    use std::thread;

    fn color(seq: u64, fill: u8) -> Frame {
        Frame::new(
            StreamKind::Color,
            PixelFormat::Bgr8,
            16,
            8,
            seq,
            Bytes::from(vec![fill; 16 * 8 * 3]),
        )
        .unwrap()
    }

    #[test]
    fn empty_buffer_has_no_snapshot() {
        let buffer = FrameBuffer::new();
        assert!(buffer.snapshot(StreamKind::Color).is_none());
        assert!(buffer.snapshot(StreamKind::Depth).is_none());
    }

    #[test]
    fn snapshot_returns_latest_and_is_independent() {
        let buffer = FrameBuffer::new();
        assert!(buffer.publish(color(1, 10)));
        let first = buffer.snapshot(StreamKind::Color).unwrap();
        assert!(buffer.publish(color(2, 20)));
        assert_eq!(first.sequence(), 1);
        assert_eq!(first.data[0], 10);

        let second = buffer.snapshot(StreamKind::Color).unwrap();
        assert_eq!(second.sequence(), 2);
        assert_eq!(second.data[0], 20);
        assert!(buffer.snapshot(StreamKind::Depth).is_none());
    }

    #[test]
    fn older_frames_are_rejected() {
        let buffer = FrameBuffer::new();
        assert!(buffer.publish(color(5, 1)));
        assert!(!buffer.publish(color(4, 2)));
        assert!(!buffer.publish(color(5, 3)));
        assert_eq!(buffer.latest_sequence(StreamKind::Color), Some(5));
        assert_eq!(buffer.stats().rejected, 2);
    }

    #[test]
    fn clear_empties_both_slots() {
        let buffer = FrameBuffer::new();
        buffer.publish(color(1, 1));
        buffer.clear();
        assert!(!buffer.has_frame(StreamKind::Color));
        // Sequence tracking restarts after a clear.
        assert!(buffer.publish(color(1, 1)));
    }

    #[test]
    fn concurrent_readers_never_see_torn_or_stale_frames() {
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for seq in 1..=500u64 {
                    buffer.publish(color(seq, (seq % 251) as u8));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2000 {
                        if let Some(frame) = buffer.snapshot(StreamKind::Color) {
                            let fill = (frame.sequence() % 251) as u8;
                            assert!(frame.data.iter().all(|&b| b == fill));
                            assert!(frame.sequence() >= last);
                            last = frame.sequence();
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(buffer.latest_sequence(StreamKind::Color), Some(500));
    }
}
