//! Error types for vigil.
//!
//! Errors fall into three groups:
//! - **Startup errors** ([`IdentityMapError`], [`ConfigError`], [`VisionError::Load`]):
//!   returned before any stream runs and surfaced by the binary.
//! - **Stream errors** ([`CaptureError`], [`InvalidConfigError`]): scoped to one
//!   stream. Capture errors are retried; invalid configs exclude the stream.
//! - **Per-frame errors** ([`ProcessError`]): logged, the frame is skipped and
//!   the stream keeps running.

use std::path::PathBuf;
use std::time::Duration;

/// Failure to open or read from a stream endpoint.
///
/// Every variant is transient from the point of view of the stream source:
/// it drops the connection, backs off and reconnects until the retry budget
/// is spent.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The endpoint could not be reached or refused the stream.
    #[error("connection to {url} failed: {reason}")]
    Connection {
        /// Endpoint that failed.
        url: String,
        /// Why the connection failed.
        reason: String,
    },

    /// An established connection stopped yielding frames.
    #[error("frame read failed: {0}")]
    Read(String),

    /// Connect or read did not finish in time.
    #[error("{op} timed out after {timeout:?}")]
    Timeout {
        /// Which operation timed out (`connect` or `read`).
        op: &'static str,
        /// The configured limit.
        timeout: Duration,
    },

    /// No compiled-in connector handles this URL scheme.
    #[error("no connector for scheme '{0}'")]
    UnsupportedScheme(String),
}

impl CaptureError {
    pub(crate) fn connection(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn read(reason: impl ToString) -> Self {
        Self::Read(reason.to_string())
    }
}

/// A stream entry that cannot be run. The stream is excluded at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream '{name}' ({url}): {reason}")]
pub struct InvalidConfigError {
    /// Stream name as given in the configuration.
    pub name: String,
    /// URL as given in the configuration.
    pub url: String,
    /// Why validation rejected it.
    pub reason: String,
}

/// Errors from the detection and recognition capabilities.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// A model or classifier artifact could not be loaded at startup.
    #[error("failed to load {what} from {path}: {reason}")]
    Load {
        /// Which artifact (cascade, model).
        what: &'static str,
        /// Where it was expected.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// Face detection failed on one frame.
    #[error("detection failed: {0}")]
    Detection(String),

    /// Recognition failed on one face region.
    #[error("recognition failed: {0}")]
    Recognition(String),
}

/// A frame payload could not be turned into an image.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The compressed payload is corrupt.
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] image::ImageError),

    /// A raw payload does not match its declared dimensions.
    #[error("raw frame of {len} bytes does not fit {width}x{height}x3")]
    SizeMismatch {
        /// Payload length.
        len: usize,
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
    },
}

/// An output sink rejected an annotated frame.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The receiving side of a channel sink is gone.
    #[error("sink channel closed")]
    ChannelClosed,

    /// Writing a snapshot failed.
    #[error("snapshot write to {path} failed: {source}")]
    Snapshot {
        /// Target file.
        path: PathBuf,
        /// Encoder or I/O error.
        #[source]
        source: image::ImageError,
    },
}

/// Anything that can go wrong while processing a single frame.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Frame payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Detection or recognition failed.
    #[error(transparent)]
    Vision(#[from] VisionError),

    /// The sink refused the annotated frame.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// The identity mapping file is missing or malformed.
#[derive(Debug, thiserror::Error)]
pub enum IdentityMapError {
    /// The file could not be read.
    #[error("failed to read identity map {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not `<integer id>:<name>`.
    #[error("malformed identity map line {line}: {content:?}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        content: String,
    },
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config crate rejected a source or failed to deserialize.
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Lifecycle misuse of a supervisor.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// `start` was called on a supervisor that already ran.
    #[error("stream '{0}' was already started")]
    AlreadyStarted(String),
}

/// The overlay font could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The font file could not be read.
    #[error("failed to read font {path}: {source}")]
    Io {
        /// Font path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a usable TrueType/OpenType font.
    #[error("{path} is not a valid font")]
    InvalidFont {
        /// Font path.
        path: PathBuf,
    },

    /// The font compiled into the binary failed to parse.
    #[error("bundled overlay font is corrupt")]
    BundledFont,
}
