//! Output side of the pipeline: overlay drawing and frame sinks.

#[cfg(feature = "sdl-display")]
pub mod display;
pub mod overlay;
pub mod sink;

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;

use crate::error::SinkError;
use crate::vision::{BoundingBox, Classification};

#[cfg(feature = "sdl-display")]
pub use display::Sdl2Display;
pub use overlay::Overlay;
pub use sink::{ChannelSink, HeadlessSink, SnapshotSink};

/// One labelled face on a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub classification: Classification,
}

/// A processed frame with its overlay already drawn.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub stream: Arc<str>,
    pub sequence: u64,
    pub image: RgbImage,
    pub faces: Vec<FaceAnnotation>,
    pub fps: f64,
    pub captured_at: Instant,
}

/// What a channel sink forwards to the display thread.
#[derive(Debug)]
pub enum SinkMessage {
    Frame(AnnotatedFrame),
    /// The stream's processor has exited; its window can go.
    Closed(Arc<str>),
}

/// Receives annotated frames from every stream's processor.
///
/// Called from blocking workers, so implementations may block briefly but
/// must never wait on another stream.
pub trait FrameSink: Send + Sync {
    fn present(&self, frame: AnnotatedFrame) -> Result<(), SinkError>;

    /// No more frames will arrive for `stream`.
    fn close(&self, _stream: &str) {}
}
