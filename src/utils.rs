use async_trait::async_trait;
use tracing::{debug, info};
#[cfg(feature = "gstreamer-pipeline")]
use tracing::warn;
use url::Url;

use crate::capture::{Connection, Connector, MjpegConnector};
use crate::error::CaptureError;
use crate::PipelineConfig;

/// Picks a connector by URL scheme.
///
/// `http` is served by the built-in MJPEG reader. `rtsp`, `rtsps` and
/// `https` need GStreamer or OpenCV; GStreamer wins when both are compiled in.
pub struct SchemeRouter {
    mjpeg: MjpegConnector,
    #[cfg(feature = "gstreamer-pipeline")]
    gstreamer: Option<crate::capture::gst_capture::GstConnector>,
    #[cfg(feature = "opencv")]
    opencv: crate::capture::opencv_capture::OpenCvConnector,
}

impl SchemeRouter {
    pub fn new(config: &PipelineConfig) -> Self {
        #[cfg(feature = "gstreamer-pipeline")]
        let gstreamer = match crate::capture::gst_capture::GstConnector::new() {
            Ok(connector) => Some(connector),
            Err(e) => {
                warn!("GStreamer unavailable: {e}");
                None
            }
        };

        let router = Self {
            mjpeg: MjpegConnector::new(config.max_frame_bytes),
            #[cfg(feature = "gstreamer-pipeline")]
            gstreamer,
            #[cfg(feature = "opencv")]
            opencv: crate::capture::opencv_capture::OpenCvConnector,
        };
        info!(schemes = ?router.schemes(), "stream connectors ready");
        router
    }

    /// Schemes this build can open.
    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes = vec!["http"];
        if self.streaming_backend().is_some() {
            schemes.extend(["rtsp", "rtsps", "https"]);
        }
        schemes
    }

    fn streaming_backend(&self) -> Option<&dyn Connector> {
        #[allow(unused_mut)]
        let mut backend: Option<&dyn Connector> = None;
        #[cfg(feature = "opencv")]
        {
            backend = Some(&self.opencv);
        }
        #[cfg(feature = "gstreamer-pipeline")]
        if let Some(gstreamer) = &self.gstreamer {
            backend = Some(gstreamer);
        }
        backend
    }

    fn route(&self, url: &Url) -> Result<&dyn Connector, CaptureError> {
        let unsupported = || CaptureError::UnsupportedScheme(url.scheme().to_string());
        match url.scheme() {
            "http" => Ok(&self.mjpeg),
            "rtsp" | "rtsps" | "https" => self.streaming_backend().ok_or_else(unsupported),
            _ => Err(unsupported()),
        }
    }
}

#[async_trait]
impl Connector for SchemeRouter {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError> {
        let connector = self.route(url)?;
        debug!(url = %url, scheme = url.scheme(), "routing connection");
        connector.connect(url).await
    }
}
