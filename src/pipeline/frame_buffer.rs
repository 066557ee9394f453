//! Bounded SPSC frame buffer between capture and processing.
//!
//! Overflow policy: drop the incoming frame and keep the backlog. A push
//! never blocks; a pop blocks for at most the given timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{RecvTimeoutError, TrySendError};

use crate::Frame;

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Counters for one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Buffer was full; the pushed frame was discarded.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// Result of a bounded-wait pop.
#[derive(Debug)]
pub enum PopOutcome {
    Frame(Frame),
    TimedOut,
    /// The producer is gone and every queued frame has been consumed.
    Closed,
}

/// Create a buffer holding at most `capacity` frames (minimum 1).
pub fn frame_buffer(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = flume::bounded(capacity);
    let stats = Arc::new(CachePadded::new(Stats::default()));
    (
        FrameProducer {
            tx,
            stats: stats.clone(),
            capacity,
        },
        FrameConsumer { rx, stats, capacity },
    )
}

/// Capture side of a frame buffer.
pub struct FrameProducer {
    tx: flume::Sender<Frame>,
    stats: Arc<CachePadded<Stats>>,
    capacity: usize,
}

impl FrameProducer {
    pub fn push(&self, frame: Frame) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        load(&self.stats)
    }
}

/// Processing side of a frame buffer.
pub struct FrameConsumer {
    rx: flume::Receiver<Frame>,
    stats: Arc<CachePadded<Stats>>,
    capacity: usize,
}

impl FrameConsumer {
    pub fn pop(&self, timeout: Duration) -> PopOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                PopOutcome::Frame(frame)
            }
            Err(RecvTimeoutError::Timeout) => PopOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => PopOutcome::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        load(&self.stats)
    }
}

fn load(stats: &Stats) -> BufferStats {
    BufferStats {
        written: stats.frames_written.load(Ordering::Relaxed),
        read: stats.frames_read.load(Ordering::Relaxed),
        dropped: stats.frames_dropped.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::time::Instant;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            Bytes::from_static(&[0, 0, 0]),
            FrameMetadata {
                sequence,
                width: 1,
                height: 1,
                format: PixelFormat::Rgb24,
            },
        )
    }

    fn sequence(outcome: PopOutcome) -> u64 {
        match outcome {
            PopOutcome::Frame(f) => f.meta.sequence,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_full_buffer_drops_newest() {
        let (tx, rx) = frame_buffer(3);
        for seq in 1..=5 {
            let expected = if seq <= 3 {
                PushOutcome::Queued
            } else {
                PushOutcome::Dropped
            };
            assert_eq!(tx.push(frame(seq)), expected);
        }
        assert_eq!(tx.len(), 3);

        let got: Vec<u64> = (0..3)
            .map(|_| sequence(rx.pop(Duration::from_millis(10))))
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(
            rx.stats(),
            BufferStats {
                written: 3,
                read: 3,
                dropped: 2
            }
        );
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let (_tx, rx) = frame_buffer(2);
        let start = Instant::now();
        assert!(matches!(
            rx.pop(Duration::from_millis(20)),
            PopOutcome::TimedOut
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_drains_then_reports_closed() {
        let (tx, rx) = frame_buffer(2);
        tx.push(frame(7));
        drop(tx);
        assert_eq!(sequence(rx.pop(Duration::from_millis(10))), 7);
        assert!(matches!(
            rx.pop(Duration::from_millis(10)),
            PopOutcome::Closed
        ));
    }

    #[test]
    fn test_push_after_consumer_gone() {
        let (tx, rx) = frame_buffer(2);
        drop(rx);
        assert_eq!(tx.push(frame(1)), PushOutcome::Closed);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (tx, _rx) = frame_buffer(0);
        assert_eq!(tx.capacity(), 1);
        assert_eq!(tx.push(frame(1)), PushOutcome::Queued);
        assert_eq!(tx.push(frame(2)), PushOutcome::Dropped);
    }

    #[test]
    fn test_slow_consumer_does_not_block_producer() {
        let (tx, rx) = frame_buffer(4);
        let start = Instant::now();
        for seq in 0..10_000 {
            tx.push(frame(seq));
        }
        // Nothing was consumed; pushes must have returned immediately.
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.len(), 4);
        assert_eq!(tx.stats().dropped, 10_000 - 4);
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let (tx, rx) = frame_buffer(capacity);
            for (i, push) in ops.into_iter().enumerate() {
                if push {
                    tx.push(frame(i as u64));
                } else {
                    let _ = rx.pop(Duration::from_millis(0));
                }
                prop_assert!(rx.len() <= capacity);
            }
            let stats = rx.stats();
            prop_assert_eq!(stats.written, stats.read + rx.len() as u64);
        }
    }
}
