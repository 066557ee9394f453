//! Per-stream frame processing: decode, detect, recognize, annotate, present.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::decoder::{decode_frame, to_gray};
use crate::capture::Frame;
use crate::display::{AnnotatedFrame, FaceAnnotation, FrameSink, Overlay};
use crate::error::ProcessError;
use crate::event::StreamEvent;
use crate::pipeline::fps::FpsCounter;
use crate::pipeline::frame_buffer::{BufferStats, FrameConsumer, PopOutcome};
use crate::state::StreamState;
use crate::vision::{classify, Capabilities, FaceDetector, NoDetection};

pub struct FrameProcessor {
    stream: Arc<str>,
    detector: Box<dyn FaceDetector>,
    capabilities: Arc<Capabilities>,
    overlay: Arc<Overlay>,
    sink: Arc<dyn FrameSink>,
    state: Arc<StreamState>,
    fps: FpsCounter,
}

impl FrameProcessor {
    pub fn new(
        state: Arc<StreamState>,
        capabilities: Arc<Capabilities>,
        overlay: Arc<Overlay>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let stream = state.name().clone();
        let detector = capabilities.detectors.create().unwrap_or_else(|e| {
            error!(stream = %stream, error = %e, "detector unavailable, faces will not be detected");
            Box::new(NoDetection) as Box<dyn FaceDetector>
        });
        Self {
            stream,
            detector,
            capabilities,
            overlay,
            sink,
            state,
            fps: FpsCounter::new(),
        }
    }

    /// Process one frame and hand it to the sink. `now` is the instant the
    /// frame counts as processed for FPS purposes.
    pub fn process(&mut self, frame: Frame, now: Instant) -> Result<Vec<FaceAnnotation>, ProcessError> {
        let started = Instant::now();
        let mut image = decode_frame(&frame)?;
        let gray = to_gray(&image);

        let boxes = self.detector.detect(&gray)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let region = imageops::crop_imm(&gray, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
            if region.width() == 0 || region.height() == 0 {
                debug!(stream = %self.stream, ?bbox, "face box outside frame, skipped");
                continue;
            }
            let recognition = self.capabilities.recognizer.predict(&region)?;
            let classification = classify(
                &recognition,
                self.capabilities.threshold,
                &self.capabilities.identities,
            );
            if classification.recognized {
                info!(
                    stream = %self.stream,
                    identity = %classification.name,
                    confidence = classification.confidence,
                    "Stream {}: Detected {} with confidence {}%",
                    self.stream,
                    classification.name,
                    classification.confidence
                );
                self.state.emit(StreamEvent::Recognized {
                    stream: self.stream.clone(),
                    name: classification.name.clone(),
                    confidence: classification.confidence,
                });
            }
            faces.push(FaceAnnotation {
                bbox,
                classification,
            });
        }

        let fps = self.fps.tick(now);
        self.overlay.draw(&mut image, &faces, fps, &self.stream);
        self.sink.present(AnnotatedFrame {
            stream: self.stream.clone(),
            sequence: frame.meta.sequence,
            image,
            faces: faces.clone(),
            fps,
            captured_at: frame.timestamp,
        })?;

        self.state.record_processed(now, fps);
        let label = self.stream.to_string();
        metrics::counter!("vigil_frames_processed_total", "stream" => label.clone()).increment(1);
        metrics::gauge!("vigil_stream_fps", "stream" => label.clone()).set(fps);
        metrics::histogram!("vigil_process_time_us", "stream" => label)
            .record(started.elapsed().as_micros() as f64);
        Ok(faces)
    }

    /// Blocking processing loop. Returns once the capture side has gone and
    /// the buffer is drained, or once `token` is cancelled; either way
    /// within `poll` of the event.
    pub fn run(mut self, buffer: FrameConsumer, token: CancellationToken, poll: Duration) -> BufferStats {
        debug!(stream = %self.stream, "processor started");
        while !token.is_cancelled() {
            match buffer.pop(poll) {
                PopOutcome::Frame(frame) => {
                    let sequence = frame.meta.sequence;
                    if let Err(e) = self.process(frame, Instant::now()) {
                        warn!(stream = %self.stream, sequence, error = %e, "frame skipped");
                        self.state.record_skipped();
                        metrics::counter!("vigil_frames_skipped_total", "stream" => self.stream.to_string())
                            .increment(1);
                    }
                }
                PopOutcome::TimedOut => {}
                PopOutcome::Closed => break,
            }
        }
        self.sink.close(&self.stream);
        debug!(stream = %self.stream, "processor stopped");
        buffer.stats()
    }
}
