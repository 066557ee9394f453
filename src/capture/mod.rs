pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod mjpeg;
pub mod mock;
#[cfg(feature = "opencv")]
pub mod opencv_capture;
pub mod source;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use mjpeg::MjpegConnector;
pub use source::{Connection, Connector, RetryPolicy, StreamOutcome, StreamSource};
