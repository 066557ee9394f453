//! OpenCV `VideoCapture` connector. Handles RTSP and HTTP through whatever
//! backend OpenCV was built with.

use async_trait::async_trait;
use bytes::Bytes;
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::debug;
use url::Url;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{Connection, Connector};
use crate::error::CaptureError;

#[derive(Debug, Default)]
pub struct OpenCvConnector;

#[async_trait]
impl Connector for OpenCvConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError> {
        let target = url.to_string();
        let capture = tokio::task::spawn_blocking(move || -> Result<VideoCapture, String> {
            let capture =
                VideoCapture::from_file(&target, videoio::CAP_ANY).map_err(|e| e.to_string())?;
            if !capture.is_opened().map_err(|e| e.to_string())? {
                return Err("stream could not be opened".to_string());
            }
            Ok(capture)
        })
        .await
        .map_err(|e| CaptureError::connection(url.as_str(), e))?
        .map_err(|reason| CaptureError::connection(url.as_str(), reason))?;

        debug!(url = %url, "opencv capture opened");
        Ok(Box::new(OpenCvConnection {
            capture: Some(capture),
        }))
    }
}

struct OpenCvConnection {
    /// Moved into the blocking read and put back afterwards.
    capture: Option<VideoCapture>,
}

#[async_trait]
impl Connection for OpenCvConnection {
    async fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut capture = self
            .capture
            .take()
            .ok_or_else(|| CaptureError::read("capture lost after an interrupted read"))?;

        let (capture, result) = tokio::task::spawn_blocking(move || {
            let mut mat = Mat::default();
            let result = capture.read(&mut mat).map(|ok| (ok, mat));
            (capture, result)
        })
        .await
        .map_err(CaptureError::read)?;
        self.capture = Some(capture);

        let (ok, mat) = result.map_err(CaptureError::read)?;
        if !ok || mat.empty() {
            return Err(CaptureError::read("no frame returned"));
        }
        to_frame(&mat)
    }
}

fn to_frame(mat: &Mat) -> Result<Frame, CaptureError> {
    if mat.channels() != 3 {
        return Err(CaptureError::read(format!(
            "expected 3 channels, got {}",
            mat.channels()
        )));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone().map_err(CaptureError::read)?;
        &owned
    };
    let data = mat.data_bytes().map_err(CaptureError::read)?;

    Ok(Frame::new(
        Bytes::copy_from_slice(data),
        FrameMetadata {
            sequence: 0,
            width: mat.cols() as u32,
            height: mat.rows() as u32,
            format: PixelFormat::Bgr24,
        },
    ))
}
