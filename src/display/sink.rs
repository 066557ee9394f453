use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use image::{ImageError, ImageFormat};
use tracing::{debug, trace, warn};

use crate::display::{AnnotatedFrame, FrameSink, SinkMessage};
use crate::error::SinkError;

/// Discards frames after a trace line.
#[derive(Debug, Default)]
pub struct HeadlessSink;

impl FrameSink for HeadlessSink {
    fn present(&self, frame: AnnotatedFrame) -> Result<(), SinkError> {
        trace!(
            stream = %frame.stream,
            sequence = frame.sequence,
            faces = frame.faces.len(),
            fps = frame.fps,
            "frame processed"
        );
        Ok(())
    }
}

/// Forwards frames to a display thread over a bounded channel.
///
/// When the display falls behind, new frames are dropped rather than
/// blocking the processor.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(depth: usize) -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = flume::bounded(depth.max(1));
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn present(&self, frame: AnnotatedFrame) -> Result<(), SinkError> {
        match self.tx.try_send(SinkMessage::Frame(frame)) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::ChannelClosed),
        }
    }

    fn close(&self, stream: &str) {
        let message = SinkMessage::Closed(Arc::from(stream));
        if self.tx.send_timeout(message, Duration::from_secs(1)).is_err() {
            debug!(stream, "display did not take the close notice");
        }
    }
}

/// Periodically writes the latest annotated frame of each stream to
/// `<dir>/<stream>.jpg`.
///
/// The cadence follows each frame's capture sequence, so streams never
/// contend with each other. Frames dropped before processing can skip a
/// snapshot; the next due sequence writes one.
pub struct SnapshotSink {
    dir: PathBuf,
    every: u64,
}

impl SnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, every: u64) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SinkError::Snapshot {
            path: dir.clone(),
            source: ImageError::IoError(e),
        })?;
        Ok(Self {
            dir,
            every: every.max(1),
        })
    }

    pub fn path_for(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", file_stem(stream)))
    }

    /// Sequences start at 1; the first frame always gets a snapshot.
    fn due(&self, sequence: u64) -> bool {
        sequence.saturating_sub(1) % self.every == 0
    }
}

impl FrameSink for SnapshotSink {
    fn present(&self, frame: AnnotatedFrame) -> Result<(), SinkError> {
        if !self.due(frame.sequence) {
            return Ok(());
        }
        let path = self.path_for(&frame.stream);
        write_atomically(&frame, &path).map_err(|source| SinkError::Snapshot {
            path: path.clone(),
            source,
        })?;
        trace!(stream = %frame.stream, path = %path.display(), "snapshot written");
        Ok(())
    }
}

fn write_atomically(frame: &AnnotatedFrame, path: &Path) -> Result<(), ImageError> {
    let tmp = path.with_extension("jpg.part");
    frame.image.save_with_format(&tmp, ImageFormat::Jpeg)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        warn!(path = %tmp.display(), "could not move snapshot into place");
        ImageError::IoError(e)
    })
}

/// Stream names are free text; keep them filesystem-safe.
fn file_stem(stream: &str) -> String {
    stream
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
