//! Scripted in-process connector.
//!
//! Drives the stream source without a network: each connect and read
//! consumes the next [`MockStep`], and once the script is exhausted the
//! connector falls back to its [`MockTail`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::capture::source::{Connection, Connector};
use crate::capture::Frame;
use crate::error::CaptureError;

/// Side length of the solid frames the mock produces.
pub const MOCK_FRAME_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStep {
    /// The next connect attempt fails.
    ConnectError,
    /// The next read fails and the connection is dropped.
    ReadError,
    /// The next read yields a frame.
    Frame,
}

/// Behaviour once the script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTail {
    /// Yield a frame every `frame_interval`.
    Frames,
    /// Connect, then fail every read.
    Fail,
    /// Connect, then never yield.
    Stall,
}

struct Script {
    steps: Mutex<VecDeque<MockStep>>,
    tail: MockTail,
    frame_interval: Duration,
    connects: AtomicU64,
    frames: AtomicU64,
}

impl Script {
    fn next(&self) -> Option<MockStep> {
        self.steps.lock().ok().and_then(|mut s| s.pop_front())
    }

    fn peek(&self) -> Option<MockStep> {
        self.steps.lock().ok().and_then(|s| s.front().copied())
    }

    fn push_front(&self, step: MockStep) {
        if let Ok(mut s) = self.steps.lock() {
            s.push_front(step);
        }
    }
}

pub struct MockConnector {
    script: Arc<Script>,
}

impl MockConnector {
    pub fn scripted(steps: impl IntoIterator<Item = MockStep>) -> Self {
        Self::build(steps.into_iter().collect(), MockTail::Fail, Duration::from_millis(33))
    }

    /// Endless healthy stream.
    pub fn streaming(frame_interval: Duration) -> Self {
        Self::build(VecDeque::new(), MockTail::Frames, frame_interval)
    }

    fn build(steps: VecDeque<MockStep>, tail: MockTail, frame_interval: Duration) -> Self {
        Self {
            script: Arc::new(Script {
                steps: Mutex::new(steps),
                tail,
                frame_interval,
                connects: AtomicU64::new(0),
                frames: AtomicU64::new(0),
            }),
        }
    }

    fn with_tail(self, tail: MockTail) -> Self {
        let script = &self.script;
        let steps = script.steps.lock().map(|s| s.clone()).unwrap_or_default();
        Self::build(steps, tail, script.frame_interval)
    }

    pub fn then_frames(self) -> Self {
        self.with_tail(MockTail::Frames)
    }

    pub fn then_fail(self) -> Self {
        self.with_tail(MockTail::Fail)
    }

    pub fn then_stall(self) -> Self {
        self.with_tail(MockTail::Stall)
    }

    pub fn with_frame_interval(self, frame_interval: Duration) -> Self {
        let steps = self.script.steps.lock().map(|s| s.clone()).unwrap_or_default();
        Self::build(steps, self.script.tail, frame_interval)
    }

    /// Successful and failed connect attempts so far.
    pub fn connects(&self) -> u64 {
        self.script.connects.load(Ordering::Relaxed)
    }

    /// Frames handed out so far.
    pub fn frames(&self) -> u64 {
        self.script.frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError> {
        self.script.connects.fetch_add(1, Ordering::Relaxed);
        if self.script.peek() == Some(MockStep::ConnectError) {
            self.script.next();
            return Err(CaptureError::connection(url.as_str(), "scripted connect failure"));
        }
        Ok(Box::new(MockConnection {
            script: self.script.clone(),
        }))
    }
}

struct MockConnection {
    script: Arc<Script>,
}

impl MockConnection {
    async fn frame(&self) -> Frame {
        tokio::time::sleep(self.script.frame_interval).await;
        self.script.frames.fetch_add(1, Ordering::Relaxed);
        let side = MOCK_FRAME_SIZE;
        let pixels = vec![128u8; (side * side * 3) as usize];
        Frame::new(
            Bytes::from(pixels),
            FrameMetadata {
                sequence: 0,
                width: side,
                height: side,
                format: PixelFormat::Rgb24,
            },
        )
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.script.next() {
            Some(MockStep::Frame) => Ok(self.frame().await),
            Some(MockStep::ReadError) => Err(CaptureError::read("scripted read failure")),
            Some(MockStep::ConnectError) => {
                // Belongs to the next connect; this connection just drops.
                self.script.push_front(MockStep::ConnectError);
                Err(CaptureError::read("scripted disconnect"))
            }
            None => match self.script.tail {
                MockTail::Frames => Ok(self.frame().await),
                MockTail::Fail => Err(CaptureError::read("scripted read failure")),
                MockTail::Stall => std::future::pending().await,
            },
        }
    }
}
