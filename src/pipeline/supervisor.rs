//! Lifecycle of one stream: its source, buffer and processor.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::capture::{RetryPolicy, StreamOutcome, StreamSource};
use crate::error::SupervisorError;
use crate::pipeline::frame_buffer::{frame_buffer, BufferStats};
use crate::pipeline::orchestrator::StreamResources;
use crate::pipeline::processor::FrameProcessor;
use crate::state::{StreamPhase, StreamRuntimeState, StreamState};
use crate::{PipelineConfig, StreamConfig};

/// Final account of one stream, produced by [`StreamSupervisor::stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub name: Arc<str>,
    pub outcome: StreamOutcome,
    pub final_state: StreamRuntimeState,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub buffer: BufferStats,
}

impl StreamReport {
    /// Frames read from the connection, whether or not the buffer had room.
    pub fn frames_captured(&self) -> u64 {
        self.buffer.written + self.buffer.dropped
    }
}

enum Lifecycle {
    Idle,
    Running {
        capture: JoinHandle<StreamOutcome>,
        processing: JoinHandle<Result<BufferStats, String>>,
    },
    Done(StreamReport),
}

pub struct StreamSupervisor {
    config: StreamConfig,
    policy: RetryPolicy,
    buffer_capacity: usize,
    poll: Duration,
    resources: StreamResources,
    state: Arc<StreamState>,
    token: CancellationToken,
    lifecycle: Lifecycle,
}

impl StreamSupervisor {
    /// `token` should be a child of the global shutdown token.
    pub fn new(
        config: StreamConfig,
        pipeline: &PipelineConfig,
        resources: StreamResources,
        token: CancellationToken,
    ) -> Self {
        let state = Arc::new(StreamState::new(
            config.name.clone(),
            resources.events.clone(),
        ));
        Self {
            config,
            policy: RetryPolicy::from(pipeline),
            buffer_capacity: pipeline.buffer_capacity,
            poll: pipeline.poll_interval(),
            resources,
            state,
            token,
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Spawn the capture task and the processing worker. Must be called
    /// from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if !matches!(self.lifecycle, Lifecycle::Idle) {
            return Err(SupervisorError::AlreadyStarted(self.config.name.to_string()));
        }

        let name = self.config.name.clone();
        let (producer, consumer) = frame_buffer(self.buffer_capacity);
        let source = StreamSource::new(
            &self.config,
            self.resources.connector.clone(),
            self.policy,
            self.state.clone(),
            producer,
            self.token.clone(),
        );
        let processor = FrameProcessor::new(
            self.state.clone(),
            self.resources.capabilities.clone(),
            self.resources.overlay.clone(),
            self.resources.sink.clone(),
        );

        let span = info_span!("stream", name = %name);
        let inner = tokio::spawn(source.run().instrument(span.clone()));
        let state = self.state.clone();
        let capture = tokio::spawn(async move {
            match inner.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stream = %state.name(), "capture task died: {e}");
                    state.transition(StreamPhase::Failed);
                    StreamOutcome::Failed {
                        attempts: state.retry_count() + 1,
                        last_error: format!("capture task died: {e}"),
                    }
                }
            }
        });

        let token = self.token.clone();
        let poll = self.poll;
        let worker_span = span.clone();
        let inner = tokio::task::spawn_blocking(move || {
            let _entered = worker_span.enter();
            processor.run(consumer, token, poll)
        });
        let state = self.state.clone();
        let token = self.token.clone();
        let processing = tokio::spawn(async move {
            inner.await.map_err(|e| {
                error!(stream = %state.name(), "processing worker died: {e}");
                state.transition(StreamPhase::Failed);
                token.cancel();
                format!("processing worker died: {e}")
            })
        });

        info!(stream = %name, url = %self.config.url, "stream started");
        self.lifecycle = Lifecycle::Running {
            capture,
            processing,
        };
        Ok(())
    }

    /// Ask both tasks to finish. Never blocks.
    pub fn signal_stop(&self) {
        self.token.cancel();
    }

    /// Signal, then wait for both tasks. Idempotent: later calls return the
    /// same report.
    pub async fn stop(&mut self) -> StreamReport {
        self.signal_stop();
        let report = match std::mem::replace(&mut self.lifecycle, Lifecycle::Idle) {
            Lifecycle::Done(report) => report,
            Lifecycle::Idle => {
                self.state.transition(StreamPhase::Stopped);
                self.report(StreamOutcome::Stopped, BufferStats::default())
            }
            Lifecycle::Running {
                capture,
                processing,
            } => {
                let mut outcome = capture.await.unwrap_or_else(|e| StreamOutcome::Failed {
                    attempts: self.state.retry_count() + 1,
                    last_error: e.to_string(),
                });
                let buffer = match processing.await {
                    Ok(Ok(stats)) => stats,
                    Ok(Err(reason)) => {
                        outcome = StreamOutcome::Failed {
                            attempts: self.state.retry_count() + 1,
                            last_error: reason,
                        };
                        BufferStats::default()
                    }
                    Err(e) => {
                        error!(stream = %self.config.name, "processing join failed: {e}");
                        BufferStats::default()
                    }
                };
                let report = self.report(outcome, buffer);
                info!(
                    stream = %report.name,
                    phase = %report.final_state.phase,
                    processed = report.frames_processed,
                    "stream stopped"
                );
                report
            }
        };
        self.lifecycle = Lifecycle::Done(report.clone());
        report
    }

    fn report(&self, outcome: StreamOutcome, buffer: BufferStats) -> StreamReport {
        StreamReport {
            name: self.config.name.clone(),
            outcome,
            final_state: self.state.snapshot(),
            frames_processed: self.state.frames_processed(),
            frames_skipped: self.state.frames_skipped(),
            buffer,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.phase()
    }

    pub fn snapshot(&self) -> StreamRuntimeState {
        self.state.snapshot()
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.lifecycle, Lifecycle::Idle)
    }
}
