use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

/// One sample read from a stream, as the connector produced it.
///
/// Cloning shares the payload; nothing is copied until decode.
#[derive(Clone)]
pub struct Frame {
    /// Encoded JPEG for MJPEG cameras, packed 3-byte pixels otherwise
    pub data: Bytes,
    pub meta: Arc<FrameMetadata>,
    /// When the connector handed the frame over
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Stamped by the stream source: starts at 1, keeps counting across reconnects
    pub sequence: u64,
    /// Zero when the payload carries its own dimensions (MJPEG)
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Payload layouts the connectors emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// GStreamer appsink output
    Rgb24,
    /// OpenCV `VideoCapture` output
    Bgr24,
    /// One complete JPEG per frame
    Mjpeg,
}
