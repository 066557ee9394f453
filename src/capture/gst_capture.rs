//! GStreamer-backed connector for RTSP and anything else `uridecodebin`
//! can open.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::{Connection, Connector};
use crate::error::CaptureError;

/// How long one blocking pull may wait before the bus is checked again.
const PULL_SLICE: Duration = Duration::from_millis(250);

pub struct GstConnector {
    /// Latency for `rtspsrc`, in milliseconds
    rtsp_latency_ms: u32,
}

impl GstConnector {
    pub fn new() -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::connection("gstreamer", e))?;
        Ok(Self {
            rtsp_latency_ms: 200,
        })
    }

    fn pipeline_string(&self, url: &Url) -> String {
        match url.scheme() {
            "rtsp" | "rtsps" => format!(
                "rtspsrc location=\"{url}\" latency={} ! \
                 decodebin ! \
                 videoconvert ! \
                 video/x-raw,format=RGB ! \
                 appsink name=appsink",
                self.rtsp_latency_ms
            ),
            _ => format!(
                "uridecodebin uri=\"{url}\" ! \
                 videoconvert ! \
                 video/x-raw,format=RGB ! \
                 appsink name=appsink"
            ),
        }
    }
}

#[async_trait]
impl Connector for GstConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError> {
        let description = self.pipeline_string(url);
        let target = url.to_string();
        let session = tokio::task::spawn_blocking(move || GstSession::open(&target, &description))
            .await
            .map_err(|e| CaptureError::connection(url.as_str(), e))??;
        Ok(Box::new(session))
    }
}

struct GstSession {
    url: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstSession {
    fn open(url: &str, description: &str) -> Result<Self, CaptureError> {
        let fail = |reason: String| CaptureError::connection(url, reason);
        debug!(url, pipeline = description, "launching gstreamer pipeline");

        let pipeline = gst::parse::launch(description)
            .map_err(|e| fail(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| fail("launch did not produce a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| fail("appsink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| fail("appsink has the wrong type".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let session = Self {
            url: url.to_string(),
            pipeline,
            appsink,
        };

        session
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail(format!("failed to start pipeline: {e:?}")))?;

        let (state_change, _, _) = session
            .pipeline
            .state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) => info!(url, "pipeline playing"),
            Ok(gst::StateChangeSuccess::Async) => info!(url, "pipeline starting asynchronously"),
            Ok(gst::StateChangeSuccess::NoPreroll) => info!(url, "live pipeline playing"),
            Err(_) => {
                let reason = session
                    .bus_error()
                    .unwrap_or_else(|| "pipeline refused to play".to_string());
                return Err(fail(reason));
            }
        }

        Ok(session)
    }

    /// First error or EOS posted on the pipeline bus, if any.
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let message = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
        match message.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            gst::MessageView::Eos(_) => Some("end of stream".to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl Connection for GstSession {
    async fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            let appsink = self.appsink.clone();
            let sample = tokio::task::spawn_blocking(move || {
                appsink.try_pull_sample(gst::ClockTime::from_mseconds(PULL_SLICE.as_millis() as u64))
            })
            .await
            .map_err(CaptureError::read)?;

            if let Some(sample) = sample {
                return to_frame(&sample);
            }
            if let Some(reason) = self.bus_error() {
                return Err(CaptureError::read(reason));
            }
            if self.appsink.is_eos() {
                return Err(CaptureError::read("end of stream"));
            }
        }
    }
}

fn to_frame(sample: &gst::Sample) -> Result<Frame, CaptureError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| CaptureError::read("sample contains no buffer"))?;
    let map = buffer
        .map_readable()
        .map_err(|_| CaptureError::read("failed to map buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| CaptureError::read("sample has no caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| CaptureError::read("failed to parse video info from caps"))?;

    let (width, height) = (info.width(), info.height());
    let row = width as usize * 3;
    let stride = info.stride().first().copied().unwrap_or(0) as usize;
    let pixels = map.as_slice();

    // videoconvert pads RGB rows to four bytes
    let data = if stride == row {
        Bytes::copy_from_slice(pixels)
    } else {
        let mut packed = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let line = pixels
                .get(start..start + row)
                .ok_or_else(|| CaptureError::read("buffer shorter than caps"))?;
            packed.extend_from_slice(line);
        }
        Bytes::from(packed)
    };

    Ok(Frame::new(
        data,
        FrameMetadata {
            sequence: 0,
            width,
            height,
            format: PixelFormat::Rgb24,
        },
    ))
}

impl Drop for GstSession {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(url = %self.url, "failed to stop pipeline: {e:?}");
        }
    }
}
