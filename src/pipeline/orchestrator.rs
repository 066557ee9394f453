//! Runs every configured stream and owns the global shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::{Connector, StreamOutcome};
use crate::display::{FrameSink, Overlay};
use crate::error::InvalidConfigError;
use crate::event::StreamEvent;
use crate::pipeline::supervisor::{StreamReport, StreamSupervisor};
use crate::vision::Capabilities;
use crate::{PipelineConfig, StreamConfig, StreamEntry};

/// Shared, read-only collaborators handed to every supervisor.
#[derive(Clone)]
pub struct StreamResources {
    pub connector: Arc<dyn Connector>,
    pub capabilities: Arc<Capabilities>,
    pub overlay: Arc<Overlay>,
    pub sink: Arc<dyn FrameSink>,
    /// Optional observer for phase changes and recognitions.
    pub events: Option<flume::Sender<StreamEvent>>,
}

/// Split entries into runnable configs and rejections, keeping order.
pub fn validate(entries: &[StreamEntry]) -> (Vec<StreamConfig>, Vec<InvalidConfigError>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for entry in entries {
        match StreamConfig::try_from(entry) {
            Ok(config) => valid.push(config),
            Err(e) => rejected.push(e),
        }
    }
    (valid, rejected)
}

/// Per-stream lines of the shutdown log.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    pub streams: Vec<StreamReport>,
    pub rejected: Vec<InvalidConfigError>,
}

impl ShutdownSummary {
    pub fn failed(&self) -> usize {
        self.streams
            .iter()
            .filter(|r| matches!(r.outcome, StreamOutcome::Failed { .. }))
            .count()
    }

    fn log(&self) {
        for report in &self.streams {
            info!(
                stream = %report.name,
                phase = %report.final_state.phase,
                captured = report.frames_captured(),
                dropped = report.buffer.dropped,
                processed = report.frames_processed,
                skipped = report.frames_skipped,
                fps = format_args!("{:.1}", report.final_state.fps),
                "stream summary"
            );
        }
        info!(
            streams = self.streams.len(),
            failed = self.failed(),
            rejected = self.rejected.len(),
            "all streams stopped"
        );
    }
}

pub struct Orchestrator {
    supervisors: Vec<StreamSupervisor>,
    rejected: Vec<InvalidConfigError>,
    shutdown: CancellationToken,
    poll: Duration,
}

impl Orchestrator {
    /// Validate `entries` and build one supervisor per valid stream.
    /// Invalid entries are logged and skipped.
    pub fn new(
        entries: &[StreamEntry],
        pipeline: &PipelineConfig,
        resources: StreamResources,
        shutdown: CancellationToken,
    ) -> Self {
        let (valid, rejected) = validate(entries);
        for e in &rejected {
            error!(stream = %e.name, url = %e.url, "{e}");
        }
        let supervisors = valid
            .into_iter()
            .map(|config| {
                StreamSupervisor::new(config, pipeline, resources.clone(), shutdown.child_token())
            })
            .collect();
        Self {
            supervisors,
            rejected,
            shutdown,
            poll: pipeline.poll_interval(),
        }
    }

    pub fn start_all(&mut self) {
        for supervisor in &mut self.supervisors {
            if let Err(e) = supervisor.start() {
                warn!("{e}");
            }
        }
        info!(streams = self.supervisors.len(), "all streams started");
    }

    pub fn supervisors(&self) -> &[StreamSupervisor] {
        &self.supervisors
    }

    pub fn supervisor(&self, name: &str) -> Option<&StreamSupervisor> {
        self.supervisors.iter().find(|s| s.name() == name)
    }

    pub fn rejected(&self) -> &[InvalidConfigError] {
        &self.rejected
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop one stream without touching the others.
    pub async fn stop_stream(&mut self, name: &str) -> Option<StreamReport> {
        let supervisor = self.supervisors.iter_mut().find(|s| s.name() == name)?;
        Some(supervisor.stop().await)
    }

    /// Wait for the shutdown signal, or for every stream to reach a terminal
    /// phase, then stop everything.
    pub async fn run(&mut self) -> ShutdownSummary {
        let mut tick = tokio::time::interval(self.poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.supervisors.iter().all(|s| s.phase().is_terminal()) {
                info!("no streams left running");
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = tick.tick() => {}
            }
        }
        self.shutdown_all().await
    }

    /// Signal every stream first so they wind down in parallel, then join
    /// them in order.
    pub async fn shutdown_all(&mut self) -> ShutdownSummary {
        for supervisor in &self.supervisors {
            supervisor.signal_stop();
        }
        let mut streams = Vec::with_capacity(self.supervisors.len());
        for supervisor in &mut self.supervisors {
            streams.push(supervisor.stop().await);
        }
        let summary = ShutdownSummary {
            streams,
            rejected: self.rejected.clone(),
        };
        summary.log();
        summary
    }
}
