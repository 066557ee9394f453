//! Per-stream runtime state and the phase machine.
//!
//! A [`StreamState`] is created by its supervisor and shared only with that
//! stream's own capture and processing tasks. Every field is an atomic so
//! neither task ever waits on the other.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::StreamEvent;

/// Lifecycle phase of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamPhase {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    Failed = 4,
    Stopped = 5,
}

impl StreamPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::Failed,
            _ => Self::Stopped,
        }
    }

    /// FAILED and STOPPED are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Whether `self -> next` is an edge of the phase machine.
    ///
    /// `Connecting|Streaming -> Failed` only happens with a zero retry budget.
    pub fn can_transition_to(self, next: StreamPhase) -> bool {
        use StreamPhase::*;
        match (self, next) {
            (Failed | Stopped, _) => false,
            (_, Stopped) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Streaming | Reconnecting | Failed) => true,
            (Streaming, Reconnecting | Failed) => true,
            (Reconnecting, Reconnecting | Streaming | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Streaming => "STREAMING",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of a stream's runtime state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRuntimeState {
    pub phase: StreamPhase,
    pub retry_count: u32,
    pub last_frame_timestamp: Option<Instant>,
    pub fps: f64,
}

/// Live state of one stream.
pub struct StreamState {
    name: Arc<str>,
    epoch: Instant,
    phase: AtomicU8,
    retry_count: AtomicU32,
    /// Nanoseconds since `epoch` plus one; zero means no frame yet.
    last_frame: AtomicU64,
    fps_bits: AtomicU64,
    frames_processed: AtomicU64,
    frames_skipped: AtomicU64,
    events: Option<flume::Sender<StreamEvent>>,
}

impl StreamState {
    pub fn new(name: Arc<str>, events: Option<flume::Sender<StreamEvent>>) -> Self {
        Self {
            name,
            epoch: Instant::now(),
            phase: AtomicU8::new(StreamPhase::Disconnected as u8),
            retry_count: AtomicU32::new(0),
            last_frame: AtomicU64::new(0),
            fps_bits: AtomicU64::new(0f64.to_bits()),
            frames_processed: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            events,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `next` if the phase machine allows it. Returns whether it moved.
    pub fn transition(&self, next: StreamPhase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        let from = loop {
            let from = StreamPhase::from_u8(current);
            if !from.can_transition_to(next) {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break from,
                Err(actual) => current = actual,
            }
        };

        let retry_count = self.retry_count();
        debug!(stream = %self.name, %from, to = %next, retry_count, "phase change");
        self.emit(StreamEvent::PhaseChanged {
            stream: self.name.clone(),
            from,
            to: next,
            retry_count,
        });
        true
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count, Ordering::Release);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Record a processed frame at `at` with the FPS it produced.
    pub(crate) fn record_processed(&self, at: Instant, fps: f64) {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_frame.store(nanos.saturating_add(1), Ordering::Relaxed);
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn last_frame_timestamp(&self) -> Option<Instant> {
        match self.last_frame.load(Ordering::Relaxed) {
            0 => None,
            n => Some(self.epoch + Duration::from_nanos(n - 1)),
        }
    }

    pub fn snapshot(&self) -> StreamRuntimeState {
        StreamRuntimeState {
            phase: self.phase(),
            retry_count: self.retry_count(),
            last_frame_timestamp: self.last_frame_timestamp(),
            fps: self.fps(),
        }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            // Observers that fall behind lose events; the stream never waits on them.
            let _ = events.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StreamState {
        StreamState::new(Arc::from("cam"), None)
    }

    #[test]
    fn test_initial_snapshot() {
        let s = state().snapshot();
        assert_eq!(s.phase, StreamPhase::Disconnected);
        assert_eq!(s.retry_count, 0);
        assert_eq!(s.last_frame_timestamp, None);
        assert_eq!(s.fps, 0.0);
    }

    #[test]
    fn test_happy_path_transitions() {
        let s = state();
        assert!(s.transition(StreamPhase::Connecting));
        assert!(s.transition(StreamPhase::Streaming));
        assert!(s.transition(StreamPhase::Reconnecting));
        assert!(s.transition(StreamPhase::Reconnecting));
        assert!(s.transition(StreamPhase::Streaming));
        assert!(s.transition(StreamPhase::Stopped));
    }

    #[test]
    fn test_terminal_phases_are_final() {
        let s = state();
        s.transition(StreamPhase::Connecting);
        s.transition(StreamPhase::Reconnecting);
        assert!(s.transition(StreamPhase::Failed));
        assert!(!s.transition(StreamPhase::Stopped));
        assert!(!s.transition(StreamPhase::Streaming));
        assert_eq!(s.phase(), StreamPhase::Failed);

        let s = state();
        assert!(s.transition(StreamPhase::Stopped));
        assert!(!s.transition(StreamPhase::Connecting));
        assert!(!s.transition(StreamPhase::Stopped));
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let s = state();
        assert!(!s.transition(StreamPhase::Streaming));
        assert!(!s.transition(StreamPhase::Reconnecting));
        s.transition(StreamPhase::Connecting);
        assert!(!s.transition(StreamPhase::Disconnected));
    }

    #[test]
    fn test_events_carry_retry_count() {
        let (tx, rx) = flume::unbounded();
        let s = StreamState::new(Arc::from("cam"), Some(tx));
        s.transition(StreamPhase::Connecting);
        s.set_retry_count(1);
        s.transition(StreamPhase::Reconnecting);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        match &events[1] {
            StreamEvent::PhaseChanged {
                from,
                to,
                retry_count,
                ..
            } => {
                assert_eq!(*from, StreamPhase::Connecting);
                assert_eq!(*to, StreamPhase::Reconnecting);
                assert_eq!(*retry_count, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_record_processed() {
        let s = state();
        let now = Instant::now();
        s.record_processed(now, 25.0);
        assert_eq!(s.fps(), 25.0);
        assert_eq!(s.frames_processed(), 1);
        let ts = s.last_frame_timestamp().unwrap();
        assert!(ts <= now + Duration::from_micros(1));
    }
}
