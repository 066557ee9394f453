//! Stream source: owns one endpoint connection, reconnects with a fixed
//! backoff and feeds the stream's frame buffer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::capture::Frame;
use crate::error::CaptureError;
use crate::pipeline::frame_buffer::{FrameProducer, PushOutcome};
use crate::state::{StreamPhase, StreamState};
use crate::{PipelineConfig, StreamConfig};

/// Opens connections to stream endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Connection>, CaptureError>;
}

/// An open stream. Dropping it releases the underlying resources.
#[async_trait]
pub trait Connection: Send {
    async fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Reconnect and timeout settings for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        }
    }
}

/// How a capture task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Stopped on request.
    Stopped,
    /// Retries exhausted.
    Failed { attempts: u32, last_error: String },
}

pub struct StreamSource {
    url: Url,
    name: Arc<str>,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state: Arc<StreamState>,
    buffer: FrameProducer,
    token: CancellationToken,
    sequence: u64,
}

impl StreamSource {
    pub fn new(
        config: &StreamConfig,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        state: Arc<StreamState>,
        buffer: FrameProducer,
        token: CancellationToken,
    ) -> Self {
        Self {
            url: config.url.clone(),
            name: config.name.clone(),
            connector,
            policy,
            state,
            buffer,
            token,
            sequence: 0,
        }
    }

    /// Capture until stopped or until the retry budget is spent.
    ///
    /// The frame buffer's producer half is dropped on return, which lets the
    /// processing task drain and exit.
    pub async fn run(mut self) -> StreamOutcome {
        self.state.transition(StreamPhase::Connecting);
        let token = self.token.clone();

        loop {
            let failure = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                failure = self.session() => failure,
            };

            metrics::counter!("vigil_reconnects_total", "stream" => self.name.to_string())
                .increment(1);

            // The max_retries-th consecutive failure is terminal; zero behaves as one.
            let failures = self.state.retry_count() + 1;
            self.state.set_retry_count(failures);
            if failures >= self.policy.max_retries {
                error!(
                    stream = %self.name,
                    attempts = failures,
                    error = %failure,
                    "Stream {}: max retries exceeded, giving up", self.name
                );
                metrics::counter!("vigil_streams_failed_total", "stream" => self.name.to_string())
                    .increment(1);
                self.state.transition(StreamPhase::Failed);
                return StreamOutcome::Failed {
                    attempts: failures,
                    last_error: failure.to_string(),
                };
            }

            self.state.transition(StreamPhase::Reconnecting);
            warn!(
                stream = %self.name,
                retry = failures,
                max_retries = self.policy.max_retries,
                error = %failure,
                "Stream {} error, reconnecting in {:?}", self.name, self.policy.backoff
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.policy.backoff) => {}
            }
        }

        info!(stream = %self.name, "capture stopped");
        self.state.transition(StreamPhase::Stopped);
        StreamOutcome::Stopped
    }

    /// Connect and read frames until something fails. The connection is
    /// dropped when this returns or when the future is cancelled.
    async fn session(&mut self) -> CaptureError {
        let connect = self.connector.connect(&self.url);
        let mut connection = match tokio::time::timeout(self.policy.connect_timeout, connect).await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return e,
            Err(_) => {
                return CaptureError::Timeout {
                    op: "connect",
                    timeout: self.policy.connect_timeout,
                }
            }
        };
        debug!(stream = %self.name, url = %self.url, "connected");

        loop {
            match tokio::time::timeout(self.policy.read_timeout, connection.read_frame()).await {
                Ok(Ok(frame)) => self.accept(frame),
                Ok(Err(e)) => return e,
                Err(_) => {
                    return CaptureError::Timeout {
                        op: "read",
                        timeout: self.policy.read_timeout,
                    }
                }
            }
        }
    }

    fn accept(&mut self, mut frame: Frame) {
        if self.state.retry_count() != 0 {
            self.state.set_retry_count(0);
        }
        if self.state.phase() != StreamPhase::Streaming
            && self.state.transition(StreamPhase::Streaming)
        {
            info!(stream = %self.name, "streaming");
        }

        self.sequence += 1;
        Arc::make_mut(&mut frame.meta).sequence = self.sequence;
        metrics::counter!("vigil_frames_captured_total", "stream" => self.name.to_string())
            .increment(1);

        match self.buffer.push(frame) {
            PushOutcome::Queued => {}
            PushOutcome::Dropped => {
                metrics::counter!("vigil_frames_dropped_total", "stream" => self.name.to_string())
                    .increment(1);
                debug!(stream = %self.name, sequence = self.sequence, "buffer full, frame dropped");
            }
            PushOutcome::Closed => {
                debug!(stream = %self.name, "processing side gone, frame discarded");
            }
        }
    }
}
